//! Turns an arbitrary HTML page into a [`RawFeed`] using the per-feed
//! query strings.

use scraper::{Html, Selector};
use url::Url;

use crate::config::{FeedConfig, QuerySet};
use crate::dates::normalize_published;
use crate::error::UpdateError;
use crate::extract::Extractor;
use crate::feed::{RawFeed, RawItem};
use crate::query::{Mode, Query};

const DEFAULT_TITLE_QUERY: &str = "title";
const DEFAULT_DESCRIPTION_QUERY: &str = "meta[name=description]::attr(content)";

/// Every query of one feed, compiled once and reused for all entries.
#[derive(Debug, Clone, Default)]
pub struct HtmlFeedQueries {
    pub namespace: Option<Query>,
    pub name: Option<Query>,
    pub description: Option<Query>,
    pub entries: Option<Query>,
    pub link: Option<Query>,
    pub title: Option<Query>,
    pub summary: Option<Query>,
    pub content: Option<Query>,
    pub author: Option<Query>,
    pub published: Option<Query>,
    pub image: Option<Query>,
    pub video: Option<Query>,
}

impl HtmlFeedQueries {
    pub fn compile(queries: &QuerySet) -> Self {
        let compile = |q: &Option<String>| Query::compile(q.as_deref());
        Self {
            namespace: compile(&queries.namespace),
            name: compile(&queries.name).or_else(|| Query::compile(Some(DEFAULT_TITLE_QUERY))),
            description: compile(&queries.description)
                .or_else(|| Query::compile(Some(DEFAULT_DESCRIPTION_QUERY))),
            entries: compile(&queries.entries),
            link: compile(&queries.entry_link),
            title: compile(&queries.entry_title),
            summary: compile(&queries.entry_summary),
            content: compile(&queries.entry_content),
            author: compile(&queries.entry_author),
            published: compile(&queries.entry_published),
            image: compile(&queries.entry_image),
            video: compile(&queries.entry_video),
        }
    }

    /// Entry extraction needs both an entry selector and a link selector.
    pub fn is_complete(&self) -> bool {
        self.entries.is_some() && self.link.is_some()
    }
}

pub fn parse_html_feed(html: &str, feed: &FeedConfig) -> Result<RawFeed, UpdateError> {
    parse_html_feed_with(html, feed, false)
}

/// Like [`parse_html_feed`]. With `diagnostic` set, incomplete query sets
/// are still run and entries without a link are kept, which is what a user
/// tuning selectors wants to see.
pub fn parse_html_feed_with(html: &str, feed: &FeedConfig, diagnostic: bool) -> Result<RawFeed, UpdateError> {
    if html.trim().is_empty() {
        return Err(UpdateError::EmptyDocument);
    }

    let queries = HtmlFeedQueries::compile(&feed.queries);
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut extractor = Extractor::new(base_url(&document, &feed.url));
    extractor.bind("document", root);

    let mut scope = root;
    if let Some(ns) = &queries.namespace {
        if let Some(element) = extractor.select_all(ns, root).first().copied() {
            extractor.bind("ns", element);
            scope = element;
        }
    }

    let title = extractor.extract_text(queries.name.as_ref(), root, &[Mode::Text]);
    let description = extractor.extract_text(queries.description.as_ref(), root, &[Mode::Text]);

    let mut items = Vec::new();
    if let Some(entries) = &queries.entries {
        if queries.is_complete() || diagnostic {
            let text_like = [Mode::Text, Mode::InnerHtml];
            let href = [Mode::Attr("href".to_string())];
            let src = [Mode::Attr("src".to_string())];

            for element in extractor.select_all(entries, scope) {
                let link = extractor.extract_text(queries.link.as_ref(), element, &href);
                if link.is_none() && !diagnostic {
                    continue;
                }

                let published = extractor
                    .extract_text(queries.published.as_ref(), element, &[Mode::Text])
                    .map(|raw| normalize_published(&raw));

                items.push(RawItem {
                    guid: link.clone(),
                    link,
                    title: extractor.extract_text(queries.title.as_ref(), element, &text_like),
                    summary: extractor.extract_text(queries.summary.as_ref(), element, &text_like),
                    content: extractor.extract_text(queries.content.as_ref(), element, &text_like),
                    author: extractor.extract_text(queries.author.as_ref(), element, &text_like),
                    published,
                    image: extractor.extract_text(queries.image.as_ref(), element, &src),
                    video: extractor.extract_text(queries.video.as_ref(), element, &src),
                    ..Default::default()
                });
            }
        }
    }

    Ok(RawFeed {
        title,
        description,
        items,
    })
}

/// The feed URL, overridden by a `<base href>` in the page.
fn base_url(document: &Html, feed_url: &str) -> Option<Url> {
    let feed_url = Url::parse(feed_url).ok();
    let base_href = Selector::parse("base[href]")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| el.value().attr("href"));

    match (base_href, &feed_url) {
        (Some(href), Some(url)) => url.join(href).ok().or(feed_url),
        (Some(href), None) => Url::parse(href).ok(),
        (None, _) => feed_url,
    }
}
