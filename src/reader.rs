//! Readable-article extraction and HTML sanitizing.

use std::collections::HashSet;

use ammonia::UrlRelative;
use readabilityrs::{Readability, ReadabilityOptions};
use reqwest::header::HeaderMap;
use scraper::Html;
use url::Url;

use crate::error::ReaderError;
use crate::http::{browser_headers, HttpClient};

const MIN_CONTENT_CHARS: usize = 200;

const EMBED_TAGS: &[&str] = &["iframe", "video", "audio", "source"];

/// Removed together with everything inside them.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "form", "button", "select", "textarea", "nav", "aside", "footer",
    "template",
];

const URL_SCHEMES: &[&str] = &["http", "https", "mailto"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct SanitizeOptions {
    /// Relative `href`/`src` values are resolved against this.
    pub base_url: Option<Url>,
    /// Make links open in a new tab without a referrer.
    pub external_links: bool,
}

/// Fetch a page and extract its readable article.
pub async fn fetch_article(client: &dyn HttpClient, url: &str) -> Result<Article, ReaderError> {
    let headers: HeaderMap = browser_headers();
    let response = client.get(url, &headers).await?.error_for_status()?;
    readerify(url, &response.text())
}

/// Extract the main content of `html` as sanitized markup.
pub fn readerify(url: &str, html: &str) -> Result<Article, ReaderError> {
    let options = ReadabilityOptions::builder()
        .char_threshold(MIN_CONTENT_CHARS)
        .build();
    let parsed = Readability::new(html, Some(url), Some(options))
        .map_err(|e| ReaderError::Extract {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .parse()
        .ok_or_else(|| ReaderError::NoContent(url.to_string()))?;

    let raw = parsed.content.unwrap_or_default();
    let content = sanitize_html(
        &raw,
        &SanitizeOptions {
            base_url: Url::parse(url).ok(),
            external_links: false,
        },
    );
    let content = content.trim().to_string();

    let has_text = Html::parse_fragment(&content)
        .root_element()
        .text()
        .any(|t| !t.trim().is_empty());
    let has_media = EMBED_TAGS
        .iter()
        .chain(&["img"])
        .any(|tag| content.contains(&format!("<{}", tag)));
    if !has_text && !has_media {
        return Err(ReaderError::NoContent(url.to_string()));
    }

    Ok(Article {
        title: parsed.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        content,
    })
}

/// Sanitize an HTML fragment for display. Tags, attributes and URL schemes
/// are allow-listed; embedded players are kept.
pub fn sanitize_html(html: &str, options: &SanitizeOptions) -> String {
    let mut builder = ammonia::Builder::default();
    builder
        .add_tags(EMBED_TAGS)
        .add_tag_attributes("iframe", &["src", "width", "height", "allow", "allowfullscreen", "frameborder"])
        .add_tag_attributes("video", &["src", "poster", "controls", "width", "height"])
        .add_tag_attributes("audio", &["src", "controls"])
        .add_tag_attributes("source", &["src", "type"])
        .rm_tags(&["nav", "aside", "footer"])
        .clean_content_tags(DROPPED_TAGS.iter().copied().collect::<HashSet<_>>())
        .url_schemes(URL_SCHEMES.iter().copied().collect::<HashSet<_>>())
        .link_rel(None);

    if let Some(base) = &options.base_url {
        builder.url_relative(UrlRelative::RewriteWithBase(base.clone()));
    }
    if options.external_links {
        builder
            .set_tag_attribute_value("a", "target", "_blank")
            .link_rel(Some("nofollow noopener"));
    }

    builder.clean(html).to_string()
}
