//! Compiler for the selector language used to scrape HTML feeds.

use scraper::Selector;
use serde_json::Value;

/// A compiled query: one or more alternative plans.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub plans: Vec<Plan>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    /// Named element the chain starts from instead of the context node.
    pub namespace: Option<String>,
    pub chain: Vec<ChainStep>,
    /// `None` means the caller's fallback modes decide.
    pub mode: Option<Mode>,
    pub ops: Vec<PostOp>,
    /// Query evaluated against the document produced by `/@json-load()`.
    pub then: Option<Box<Query>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainStep {
    /// Scoped descendant query, relative to the first element of the
    /// current result set.
    Select(Css),
    /// Keep only elements whose text contains the needle.
    Contains(String),
}

impl ChainStep {
    pub fn select(text: &str) -> Self {
        ChainStep::Select(Css::new(text))
    }
}

/// Selector text and its parsed form. Text that does not parse keeps no
/// selector and matches nothing.
#[derive(Debug, Clone)]
pub struct Css {
    pub text: String,
    pub selector: Option<Selector>,
}

impl Css {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            selector: Selector::parse(text).ok(),
        }
    }
}

impl PartialEq for Css {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Text,
    InnerHtml,
    OuterHtml,
    Attr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    Append(String),
    Prepend(String),
    Split(String),
    Join(String),
    Slice(i64, Option<i64>),
    Get(i64),
    Filter(FilterMode, String),
    JsonLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Equals,
    Regex,
}

impl FilterMode {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "contains" => Some(Self::Contains),
            "not-contains" | "!contains" => Some(Self::NotContains),
            "starts-with" | "startswith" => Some(Self::StartsWith),
            "ends-with" | "endswith" => Some(Self::EndsWith),
            "equals" | "eq" => Some(Self::Equals),
            "regex" | "match" => Some(Self::Regex),
            _ => None,
        }
    }
}

impl Query {
    /// Compile a query string. Never fails.
    pub fn parse(raw: &str) -> Self {
        Parser::new(raw).parse_query()
    }

    /// Compile an optional configured query, treating blank strings as absent.
    pub fn compile(raw: Option<&str>) -> Option<Self> {
        raw.filter(|r| !r.trim().is_empty()).map(Self::parse)
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[derive(Default)]
struct PlanBuilder {
    plan: Plan,
    segment: String,
}

impl PlanBuilder {
    fn at_start(&self) -> bool {
        self.plan.namespace.is_none() && self.plan.chain.is_empty() && self.segment.trim().is_empty()
    }

    fn flush_segment(&mut self) {
        let text = self.segment.trim();
        if !text.is_empty() {
            self.plan.chain.push(ChainStep::select(text));
        }
        self.segment.clear();
    }

    fn finish(mut self) -> Option<Plan> {
        self.flush_segment();
        let plan = self.plan;
        let empty = plan.namespace.is_none()
            && plan.chain.is_empty()
            && plan.mode.is_none()
            && plan.ops.is_empty()
            && plan.then.is_none();
        (!empty).then_some(plan)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn parse_query(&mut self) -> Query {
        let mut plans = Vec::new();
        let mut builder = PlanBuilder::default();
        let mut quote: Option<char> = None;
        let mut depth = 0usize;

        while let Some(c) = self.rest().chars().next() {
            if let Some(q) = quote {
                builder.segment.push(c);
                if c == q && !builder.segment[..builder.segment.len() - 1].ends_with('\\') {
                    quote = None;
                }
                self.pos += c.len_utf8();
                continue;
            }

            if c == '@' && builder.at_start() {
                let name_rest = &self.rest()[1..];
                let end = name_rest
                    .find(|c: char| c.is_whitespace() || matches!(c, ':' | '/' | ','))
                    .unwrap_or(name_rest.len());
                if end > 0 {
                    builder.plan.namespace = Some(name_rest[..end].to_string());
                    builder.segment.clear();
                    self.pos += 1 + end;
                    continue;
                }
            }

            if depth == 0 && c == ',' {
                plans.extend(std::mem::take(&mut builder).finish());
                self.pos += 1;
                continue;
            }

            if depth == 0 && self.try_modifier(&mut builder) {
                continue;
            }

            if depth == 0 && self.rest().starts_with("/@") && self.try_post_op(&mut builder) {
                if builder.plan.then.is_some() {
                    // the continuation consumed the remainder of the input
                    break;
                }
                continue;
            }

            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                _ => {}
            }
            builder.segment.push(c);
            self.pos += c.len_utf8();
        }

        plans.extend(builder.finish());
        Query { plans }
    }

    /// Handles `:contains()`, `::text`, `::inner-html`, `::outer-html` and
    /// `::attr()`. Returns false when nothing was consumed.
    fn try_modifier(&mut self, builder: &mut PlanBuilder) -> bool {
        let rest = self.rest();
        if let Some(after) = rest.strip_prefix(":contains(") {
            let Some(close) = find_closing_paren(after) else {
                return false;
            };
            let needle = parse_args(&after[..close])
                .into_iter()
                .next()
                .map(|v| value_to_string(&v))
                .unwrap_or_default();
            builder.flush_segment();
            builder.plan.chain.push(ChainStep::Contains(needle));
            self.pos += ":contains(".len() + close + 1;
            return true;
        }
        if rest.starts_with("::text") {
            builder.plan.mode = Some(Mode::Text);
            self.pos += "::text".len();
            return true;
        }
        if rest.starts_with("::inner-html") {
            builder.plan.mode = Some(Mode::InnerHtml);
            self.pos += "::inner-html".len();
            return true;
        }
        if rest.starts_with("::outer-html") {
            builder.plan.mode = Some(Mode::OuterHtml);
            self.pos += "::outer-html".len();
            return true;
        }
        if let Some(after) = rest.strip_prefix("::attr(") {
            let Some(close) = find_closing_paren(after) else {
                return false;
            };
            let name = parse_args(&after[..close])
                .into_iter()
                .next()
                .map(|v| value_to_string(&v))
                .unwrap_or_default();
            if name.is_empty() {
                return false;
            }
            builder.plan.mode = Some(Mode::Attr(name));
            self.pos += "::attr(".len() + close + 1;
            return true;
        }
        false
    }

    fn try_post_op(&mut self, builder: &mut PlanBuilder) -> bool {
        let after = &self.rest()[2..];
        let Some(open) = after.find('(') else {
            return false;
        };
        let name = &after[..open];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return false;
        }
        let Some(close) = find_closing_paren(&after[open + 1..]) else {
            return false;
        };
        let args = parse_args(&after[open + 1..open + 1 + close]);
        let Some(op) = build_op(name, &args) else {
            return false;
        };
        self.pos += 2 + open + 1 + close + 1;

        let json_load = op == PostOp::JsonLoad;
        builder.plan.ops.push(op);
        if json_load {
            let continuation = Parser::new(self.rest()).parse_query();
            if !continuation.is_empty() {
                builder.plan.then = Some(Box::new(continuation));
                self.pos = self.src.len();
            }
        }
        true
    }
}

fn build_op(name: &str, args: &[Value]) -> Option<PostOp> {
    let arg_str = |i: usize| args.get(i).map(value_to_string).unwrap_or_default();
    let arg_int = |i: usize| args.get(i).and_then(value_to_int);

    let op = match name {
        "append" => PostOp::Append(args.iter().map(value_to_string).collect()),
        "prepend" => PostOp::Prepend(args.iter().map(value_to_string).collect()),
        "split" => PostOp::Split(arg_str(0)),
        "join" => PostOp::Join(arg_str(0)),
        "slice" => PostOp::Slice(arg_int(0).unwrap_or(0), arg_int(1)),
        "get" => PostOp::Get(arg_int(0).unwrap_or(0)),
        "filter" => {
            if args.len() >= 2 {
                let mode = FilterMode::from_name(&arg_str(0)).unwrap_or(FilterMode::Contains);
                PostOp::Filter(mode, arg_str(1))
            } else {
                PostOp::Filter(FilterMode::Contains, arg_str(0))
            }
        }
        "json-load" => PostOp::JsonLoad,
        _ => return None,
    };
    Some(op)
}

/// Index of the `)` closing an already opened paren, skipping quoted text
/// and nested parens.
fn find_closing_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Split an argument list on top-level commas and decode each token.
///
/// `'single quoted'` tokens are string literals with `\'` unescaped; any
/// other token is read as a JSON scalar and falls back to a bare string.
pub fn parse_args(inner: &str) -> Vec<Value> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in inner.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            ',' => tokens.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    tokens.push(current);

    if tokens.len() == 1 && tokens[0].trim().is_empty() {
        return Vec::new();
    }
    tokens.iter().map(|t| decode_arg(t.trim())).collect()
}

fn decode_arg(token: &str) -> Value {
    if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
        let inner = token[1..token.len() - 1].replace("\\'", "'");
        return match serde_json::from_str::<String>(&format!("\"{}\"", inner)) {
            Ok(s) => Value::String(s),
            Err(_) => Value::String(inner),
        };
    }
    serde_json::from_str::<Value>(token).unwrap_or_else(|_| Value::String(token.to_string()))
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(raw: &str) -> Plan {
        let query = Query::parse(raw);
        assert_eq!(query.plans.len(), 1, "expected one plan for {:?}", raw);
        query.plans.into_iter().next().unwrap()
    }

    mod selector_tests {
        use super::*;

        #[test]
        fn test_plain_selector_has_no_mode() {
            for raw in ["a", "div.item > a", "ul li:nth-child(2)", "a[href^='http']"] {
                let plan = single(raw);
                assert_eq!(plan.mode, None);
                assert!(plan.ops.is_empty());
                assert_eq!(plan.chain, vec![ChainStep::select(raw)]);
            }
        }

        #[test]
        fn test_selectors_parsed_at_compile_time() {
            let plan = single("div.post a::text");
            let ChainStep::Select(css) = &plan.chain[0] else {
                panic!("expected a select step");
            };
            assert_eq!(css.text, "div.post a");
            assert!(css.selector.is_some());

            let plan = single("p[[");
            let ChainStep::Select(css) = &plan.chain[0] else {
                panic!("expected a select step");
            };
            assert!(css.selector.is_none());
        }

        #[test]
        fn test_alternatives_match_independent_parses() {
            let both = Query::parse("a, b");
            assert_eq!(both.plans.len(), 2);
            assert_eq!(both.plans[0], Query::parse("a").plans[0]);
            assert_eq!(both.plans[1], Query::parse("b").plans[0]);
        }

        #[test]
        fn test_comma_inside_parens_or_quotes_is_not_a_split() {
            assert_eq!(Query::parse("div:not(.a, .b)").plans.len(), 1);
            assert_eq!(Query::parse("a[title='x, y']").plans.len(), 1);
            assert_eq!(Query::parse("a:contains('x, y')").plans.len(), 1);
        }

        #[test]
        fn test_namespace_prefix() {
            let plan = single("@ns article a::text");
            assert_eq!(plan.namespace.as_deref(), Some("ns"));
            assert_eq!(plan.chain, vec![ChainStep::select("article a")]);
            assert_eq!(plan.mode, Some(Mode::Text));
        }

        #[test]
        fn test_at_sign_later_is_literal() {
            let plan = single("a[href*='@'] b");
            assert_eq!(plan.namespace, None);
            assert_eq!(plan.chain, vec![ChainStep::select("a[href*='@'] b")]);
        }

        #[test]
        fn test_empty_query() {
            assert!(Query::parse("").is_empty());
            assert!(Query::parse(" , ").is_empty());
            assert!(Query::compile(Some("  ")).is_none());
            assert!(Query::compile(None).is_none());
        }
    }

    mod modifier_tests {
        use super::*;

        #[test]
        fn test_extraction_modes() {
            assert_eq!(single("h1::text").mode, Some(Mode::Text));
            assert_eq!(single("div::inner-html").mode, Some(Mode::InnerHtml));
            assert_eq!(single("div::outer-html").mode, Some(Mode::OuterHtml));
            assert_eq!(single("a::attr(href)").mode, Some(Mode::Attr("href".to_string())));
            assert_eq!(single("a::attr('data-src')").mode, Some(Mode::Attr("data-src".to_string())));
        }

        #[test]
        fn test_mode_only_applies_to_context() {
            let plan = single("::text");
            assert!(plan.chain.is_empty());
            assert_eq!(plan.mode, Some(Mode::Text));
        }

        #[test]
        fn test_contains_interleaves_chain() {
            let plan = single("div.post:contains('Video') a::attr(href)");
            assert_eq!(
                plan.chain,
                vec![
                    ChainStep::select("div.post"),
                    ChainStep::Contains("Video".to_string()),
                    ChainStep::select("a"),
                ]
            );
        }

        #[test]
        fn test_quoted_modifier_text_is_literal() {
            let plan = single("a[title='::text']");
            assert_eq!(plan.mode, None);
            assert_eq!(plan.chain, vec![ChainStep::select("a[title='::text']")]);
        }

        #[test]
        fn test_unterminated_modifier_stays_literal() {
            let plan = single("a::attr(href");
            assert_eq!(plan.mode, None);
            assert_eq!(plan.chain, vec![ChainStep::select("a::attr(href")]);
        }
    }

    mod post_op_tests {
        use super::*;

        #[test]
        fn test_append_and_prepend() {
            let plan = single("a::text/@append(' (via feed)')/@prepend('> ')");
            assert_eq!(
                plan.ops,
                vec![
                    PostOp::Append(" (via feed)".to_string()),
                    PostOp::Prepend("> ".to_string()),
                ]
            );
        }

        #[test]
        fn test_list_ops() {
            let plan = single("p::text/@split(',')/@slice(1, 3)/@get(0)/@join('-')");
            assert_eq!(
                plan.ops,
                vec![
                    PostOp::Split(",".to_string()),
                    PostOp::Slice(1, Some(3)),
                    PostOp::Get(0),
                    PostOp::Join("-".to_string()),
                ]
            );
        }

        #[test]
        fn test_filter_modes() {
            let plan = single("p::text/@split(' ')/@filter('starts-with', '#')");
            assert_eq!(plan.ops[1], PostOp::Filter(FilterMode::StartsWith, "#".to_string()));
            let plan = single("p::text/@filter('x')");
            assert_eq!(plan.ops[0], PostOp::Filter(FilterMode::Contains, "x".to_string()));
        }

        #[test]
        fn test_unknown_op_is_literal() {
            let plan = single("a/@frobnicate(1)");
            assert!(plan.ops.is_empty());
            assert_eq!(plan.chain, vec![ChainStep::select("a/@frobnicate(1)")]);
        }

        #[test]
        fn test_json_load_continuation() {
            let plan = single("script[type='application/ld+json']::text/@json-load() [data-key=headline]::text");
            assert_eq!(plan.ops, vec![PostOp::JsonLoad]);
            let then = plan.then.expect("continuation");
            assert_eq!(then.plans.len(), 1);
            assert_eq!(then.plans[0].chain, vec![ChainStep::select("[data-key=headline]")]);
            assert_eq!(then.plans[0].mode, Some(Mode::Text));
        }

        #[test]
        fn test_json_load_without_continuation() {
            let plan = single("script::text/@json-load()");
            assert_eq!(plan.ops, vec![PostOp::JsonLoad]);
            assert!(plan.then.is_none());
        }
    }

    mod arg_tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn test_quoted_and_scalar_args() {
            let args = parse_args("'it\\'s', 3, true, -1.5, bare");
            assert_eq!(args, vec![json!("it's"), json!(3), json!(true), json!(-1.5), json!("bare")]);
        }

        #[test]
        fn test_quoted_escape_sequences() {
            assert_eq!(parse_args("'a\\nb'"), vec![json!("a\nb")]);
            assert_eq!(parse_args("','"), vec![json!(",")]);
        }

        #[test]
        fn test_empty_args() {
            assert!(parse_args("").is_empty());
            assert!(parse_args("  ").is_empty());
        }
    }
}
