//! Normalized feed shape shared by the syndication parser and the HTML
//! adapter, and the `feed-rs` mapping into it.

use feed_rs::model::{Entry, Link, Text};
use feed_rs::parser;
use scraper::Html;

use crate::error::UpdateError;

/// A parsed feed document, before reconciliation against stored state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub items: Vec<RawItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    pub mime: String,
}

/// One incoming item. Syndication feeds populate the content/snippet and
/// media metadata fields; the HTML adapter populates `image`/`video` and
/// `author` directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    pub guid: Option<String>,
    pub link: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub content_snippet: Option<String>,
    pub encoded_content: Option<String>,
    pub encoded_snippet: Option<String>,
    pub enclosure: Option<Enclosure>,
    pub media_thumbnail: Option<String>,
    pub media_description: Vec<String>,
    pub iso_date: Option<String>,
    pub published: Option<String>,
    pub author: Option<String>,
    pub image: Option<String>,
    pub video: Option<String>,
}

/// Items without an id of their own keep an empty one, so the guid falls
/// back to the link instead of a hash that changes with the title.
pub fn parse_standard_feed(body: &[u8]) -> Result<RawFeed, UpdateError> {
    let parsed = parser::Builder::new()
        .id_generator(|_links: &[Link], _title: &Option<Text>, _uri: Option<&str>| String::new())
        .build()
        .parse(body)?;

    Ok(RawFeed {
        title: parsed.title.map(|t| t.content),
        description: parsed.description.map(|t| t.content),
        items: parsed.entries.into_iter().map(map_entry).collect(),
    })
}

fn map_entry(entry: Entry) -> RawItem {
    let guid = Some(entry.id.clone()).filter(|id| !id.trim().is_empty());
    let link = entry.links.first().map(|l| l.href.clone());
    let title = entry.title.as_ref().map(|t| t.content.trim().to_string());

    let (summary, content) = match &entry.summary {
        Some(text) if is_plain(text) => (Some(text.content.clone()), None),
        Some(text) => (None, Some(text.content.clone())),
        None => (None, None),
    };
    let content_snippet = content.as_deref().map(html_to_text);

    let encoded_content = entry.content.as_ref().and_then(|c| c.body.clone());
    let encoded_snippet = encoded_content.as_deref().map(html_to_text);

    let enclosure = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .find_map(|c| match (&c.url, &c.content_type) {
            (Some(url), Some(mime)) => Some(Enclosure {
                url: url.to_string(),
                mime: mime.essence().to_string(),
            }),
            _ => None,
        });

    let media_thumbnail = entry
        .media
        .iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| t.image.uri.clone())
        .next();

    let media_description = entry
        .media
        .iter()
        .filter_map(|m| m.description.as_ref())
        .map(|d| d.content.clone())
        .collect();

    let iso_date = entry.published.or(entry.updated).map(|dt| dt.to_rfc3339());
    let author = entry.authors.first().map(|a| a.name.clone());

    RawItem {
        guid,
        link,
        title,
        summary,
        content,
        content_snippet,
        encoded_content,
        encoded_snippet,
        enclosure,
        media_thumbnail,
        media_description,
        iso_date,
        author,
        ..Default::default()
    }
}

fn is_plain(text: &Text) -> bool {
    text.content_type.essence().to_string() == "text/plain"
}

/// Plain-text rendering of an HTML fragment, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
