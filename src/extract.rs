//! Evaluates compiled [`Query`] plans against a parsed HTML tree.

use std::collections::HashMap;

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use serde_json::Value as Json;
use tracing::debug;
use url::Url;

use crate::query::{ChainStep, FilterMode, Mode, Plan, PostOp, Query};

/// Attributes whose value is a URL and therefore gets resolved against the
/// document base before it is read.
const URL_ATTRS: &[&str] = &[
    "href", "src", "action", "formaction", "poster", "cite", "data", "background", "longdesc",
];

/// Final value of a scalar extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Text(String),
    List(Vec<String>),
}

impl Extracted {
    /// Collapse to a single string; list items are joined with `", "`.
    pub fn into_text(self) -> String {
        match self {
            Extracted::Text(s) => s,
            Extracted::List(items) => items.join(", "),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Extracted::Text(s) => s.trim().is_empty(),
            Extracted::List(items) => items.is_empty(),
        }
    }
}

/// Intermediate value threaded through post-ops.
enum Value {
    Text(String),
    List(Vec<String>),
    Document(Html),
}

/// Runs queries against one document.
pub struct Extractor<'a> {
    namespaces: HashMap<String, ElementRef<'a>>,
    base_url: Option<Url>,
}

impl<'a> Extractor<'a> {
    pub fn new(base_url: Option<Url>) -> Self {
        Self {
            namespaces: HashMap::new(),
            base_url,
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, element: ElementRef<'a>) {
        self.namespaces.insert(name.into(), element);
    }

    pub fn namespace(&self, name: &str) -> Option<ElementRef<'a>> {
        self.namespaces.get(name).copied()
    }

    /// Multi-match mode: every element matched by the first plan that
    /// matches anything. Extraction modes and post-ops are ignored.
    pub fn select_all(&self, query: &Query, context: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        for plan in &query.plans {
            let matched = self.run_chain(plan, context);
            if !matched.is_empty() {
                return matched;
            }
        }
        Vec::new()
    }

    /// Scalar mode: the value of the first plan that yields a non-empty one.
    ///
    /// `fallbacks` are tried in order when a plan names no extraction mode.
    pub fn extract(&self, query: &Query, context: ElementRef<'a>, fallbacks: &[Mode]) -> Option<Extracted> {
        query
            .plans
            .iter()
            .find_map(|plan| self.extract_plan(plan, context, fallbacks))
    }

    pub fn extract_text(&self, query: Option<&Query>, context: ElementRef<'a>, fallbacks: &[Mode]) -> Option<String> {
        self.extract(query?, context, fallbacks).map(Extracted::into_text)
    }

    fn extract_plan(&self, plan: &Plan, context: ElementRef<'a>, fallbacks: &[Mode]) -> Option<Extracted> {
        let element = *self.run_chain(plan, context).first()?;

        let raw = match &plan.mode {
            Some(mode) => self.read(element, mode),
            None => fallbacks.iter().find_map(|mode| self.read(element, mode)),
        }?;

        let mut value = Value::Text(raw);
        for op in &plan.ops {
            value = self.apply_op(value, op);
        }

        let extracted = match value {
            Value::Text(s) => Extracted::Text(s),
            Value::List(items) => Extracted::List(items),
            Value::Document(doc) => match &plan.then {
                Some(next) => {
                    let inner = Extractor::new(self.base_url.clone());
                    inner.extract(next, doc.root_element(), fallbacks)?
                }
                None => Extracted::Text(doc.root_element().inner_html()),
            },
        };

        (!extracted.is_empty()).then_some(extracted)
    }

    fn run_chain(&self, plan: &Plan, context: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        let start = match &plan.namespace {
            Some(name) => match self.namespaces.get(name) {
                Some(element) => *element,
                None => {
                    debug!(namespace = %name, "unknown query namespace");
                    return Vec::new();
                }
            },
            None => context,
        };

        let mut current = vec![start];
        for step in &plan.chain {
            match step {
                ChainStep::Select(css) => {
                    let Some(scope) = current.first().copied() else {
                        return Vec::new();
                    };
                    current = match &css.selector {
                        Some(selector) => scope.select(selector).collect(),
                        None => {
                            debug!(selector = %css.text, "unparseable selector, no match");
                            Vec::new()
                        }
                    };
                }
                ChainStep::Contains(needle) => {
                    current.retain(|el| el.text().collect::<String>().contains(needle.as_str()));
                }
            }
        }
        current
    }

    fn read(&self, element: ElementRef<'a>, mode: &Mode) -> Option<String> {
        let value = match mode {
            Mode::Text => text_with_breaks(element).trim().to_string(),
            Mode::InnerHtml => element.inner_html(),
            Mode::OuterHtml => element.html(),
            Mode::Attr(name) => self.read_attr(element, name)?,
        };
        (!value.trim().is_empty()).then_some(value)
    }

    /// URL attributes are resolved to absolute form; everything else,
    /// `style` included, is read verbatim.
    fn read_attr(&self, element: ElementRef<'a>, name: &str) -> Option<String> {
        let raw = element.value().attr(name)?;
        let lower = name.to_ascii_lowercase();
        if !URL_ATTRS.contains(&lower.as_str()) {
            return Some(raw.to_string());
        }
        match &self.base_url {
            Some(base) => Some(
                base.join(raw.trim())
                    .map(|url| url.to_string())
                    .unwrap_or_else(|_| raw.to_string()),
            ),
            None => Some(raw.to_string()),
        }
    }

    fn apply_op(&self, value: Value, op: &PostOp) -> Value {
        match (op, value) {
            (PostOp::Append(suffix), Value::Text(s)) => Value::Text(s + suffix),
            (PostOp::Append(suffix), Value::List(items)) => {
                Value::List(items.into_iter().map(|s| s + suffix).collect())
            }
            (PostOp::Prepend(prefix), Value::Text(s)) => Value::Text(format!("{}{}", prefix, s)),
            (PostOp::Prepend(prefix), Value::List(items)) => {
                Value::List(items.into_iter().map(|s| format!("{}{}", prefix, s)).collect())
            }
            (PostOp::Split(sep), Value::Text(s)) => Value::List(split(&s, sep)),
            (PostOp::Split(sep), Value::List(items)) => {
                Value::List(items.iter().flat_map(|s| split(s, sep)).collect())
            }
            (PostOp::Join(sep), Value::List(items)) => Value::Text(items.join(sep)),
            (PostOp::Slice(start, end), Value::List(items)) => {
                let (from, to) = js_range(items.len(), *start, *end);
                Value::List(items[from..to].to_vec())
            }
            (PostOp::Slice(start, end), Value::Text(s)) => {
                let chars: Vec<char> = s.chars().collect();
                let (from, to) = js_range(chars.len(), *start, *end);
                Value::Text(chars[from..to].iter().collect())
            }
            (PostOp::Get(index), Value::List(items)) => {
                Value::Text(js_index(items.len(), *index).map(|i| items[i].clone()).unwrap_or_default())
            }
            (PostOp::Get(index), Value::Text(s)) => {
                let chars: Vec<char> = s.chars().collect();
                Value::Text(js_index(chars.len(), *index).map(|i| chars[i].to_string()).unwrap_or_default())
            }
            (PostOp::Filter(mode, arg), Value::List(items)) => {
                let matcher = Matcher::new(*mode, arg);
                Value::List(items.into_iter().filter(|s| matcher.matches(s)).collect())
            }
            (PostOp::Filter(mode, arg), Value::Text(s)) => {
                if Matcher::new(*mode, arg).matches(&s) {
                    Value::Text(s)
                } else {
                    Value::Text(String::new())
                }
            }
            (PostOp::JsonLoad, Value::Text(s)) => match serde_json::from_str::<Json>(&s) {
                Ok(json) => Value::Document(Html::parse_fragment(&render_json(&json))),
                Err(e) => {
                    debug!(error = %e, "json-load on non-JSON value");
                    Value::Text(String::new())
                }
            },
            (_, value) => value,
        }
    }
}

fn split(s: &str, sep: &str) -> Vec<String> {
    if sep.is_empty() {
        s.chars().map(|c| c.to_string()).collect()
    } else {
        s.split(sep).map(str::to_string).collect()
    }
}

/// Negative bounds count from the end.
fn js_range(len: usize, start: i64, end: Option<i64>) -> (usize, usize) {
    let clamp = |i: i64| -> usize {
        if i < 0 {
            (len as i64 + i).max(0) as usize
        } else {
            (i as usize).min(len)
        }
    };
    let from = clamp(start);
    let to = end.map(clamp).unwrap_or(len);
    (from, to.max(from))
}

fn js_index(len: usize, index: i64) -> Option<usize> {
    let i = if index < 0 { len as i64 + index } else { index };
    (0..len as i64).contains(&i).then_some(i as usize)
}

struct Matcher<'m> {
    mode: FilterMode,
    arg: &'m str,
    regex: Option<Regex>,
}

impl<'m> Matcher<'m> {
    fn new(mode: FilterMode, arg: &'m str) -> Self {
        let regex = match mode {
            FilterMode::Regex => Regex::new(arg).ok(),
            _ => None,
        };
        Self { mode, arg, regex }
    }

    fn matches(&self, s: &str) -> bool {
        match self.mode {
            FilterMode::Contains => s.contains(self.arg),
            FilterMode::NotContains => !s.contains(self.arg),
            FilterMode::StartsWith => s.starts_with(self.arg),
            FilterMode::EndsWith => s.ends_with(self.arg),
            FilterMode::Equals => s == self.arg,
            FilterMode::Regex => match &self.regex {
                Some(re) => re.is_match(s),
                None => s.contains(self.arg),
            },
        }
    }
}

/// Text content of an element with `<br>` rendered as a newline.
pub fn text_with_breaks(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) if el.name() == "br" => out.push('\n'),
            _ => {}
        }
    }
    out
}

/// Render a JSON value as markup so it can be queried with selectors.
///
/// Objects become `<j-object>`, arrays `<j-array>` and scalars `<j-value>`.
/// Object members carry their key in `data-key`.
pub fn render_json(value: &Json) -> String {
    let mut out = String::new();
    render_json_node(value, None, &mut out);
    out
}

fn render_json_node(value: &Json, key: Option<&str>, out: &mut String) {
    let tag = match value {
        Json::Object(_) => "j-object",
        Json::Array(_) => "j-array",
        _ => "j-value",
    };
    out.push('<');
    out.push_str(tag);
    if let Some(key) = key {
        out.push_str(" data-key=\"");
        out.push_str(&html_escape::encode_double_quoted_attribute(key));
        out.push('"');
    }
    out.push('>');
    match value {
        Json::Object(map) => {
            for (k, v) in map {
                render_json_node(v, Some(k), out);
            }
        }
        Json::Array(items) => {
            for item in items {
                render_json_node(item, None, out);
            }
        }
        Json::String(s) => out.push_str(&html_escape::encode_text(s)),
        Json::Null => {}
        other => out.push_str(&other.to_string()),
    }
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}
