//! Merges an incoming [`RawItem`] into the stored entries.

use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::dates::parse_date;
use crate::db::{Database, Entry, EntryDraft, Feed};
use crate::error::ReconcileError;
use crate::feed::RawItem;
use crate::http::HttpClient;
use crate::media::{cache_entry_image, url_origin, MediaStore};
use crate::reader::fetch_article;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    fn mime_prefix(self) -> &'static str {
        match self {
            MediaKind::Image => "image/",
            MediaKind::Video => "video/",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            MediaKind::Image => "img",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub entry: Entry,
    pub change: Change,
    /// The article page could not be captured; the entry was still stored.
    pub degraded: bool,
}

pub struct ReconcileContext<'a> {
    pub db: &'a Database,
    pub client: &'a dyn HttpClient,
    pub media: &'a dyn MediaStore,
}

pub fn derive_guid(item: &RawItem) -> Result<String, ReconcileError> {
    item.guid
        .as_deref()
        .or(item.link.as_deref())
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(String::from)
        .ok_or(ReconcileError::MissingGuid)
}

pub fn derive_summary(item: &RawItem) -> Option<String> {
    item.summary
        .clone()
        .or_else(|| item.content_snippet.clone())
        .or_else(|| item.encoded_snippet.clone())
        .or_else(|| item.media_description.first().cloned())
}

pub fn derive_content(item: &RawItem) -> Option<String> {
    item.encoded_content.clone().or_else(|| item.content.clone())
}

pub fn draft_from_item(feed_id: i64, item: &RawItem) -> Result<EntryDraft, ReconcileError> {
    Ok(EntryDraft {
        feed_id,
        guid: derive_guid(item)?,
        link: item.link.clone(),
        title: item.title.clone(),
        summary: derive_summary(item),
        content: derive_content(item),
        author: item.author.clone(),
        published: item.iso_date.clone().or_else(|| item.published.clone()),
        ..Default::default()
    })
}

/// Whether an incoming entry differs materially from the stored one.
///
/// Publish dates only count when both sides parse; two unparseable dates
/// never signal a change on their own.
pub fn check_entry_changed(incoming: &EntryDraft, stored: &Entry) -> bool {
    let dates_differ = match (
        incoming.published.as_deref().and_then(parse_date),
        stored.published.as_deref().and_then(parse_date),
    ) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    };

    dates_differ
        || incoming.title != stored.title
        || incoming.summary != stored.summary
        || incoming.content != stored.content
}

/// First `src` of the matching media element in an HTML fragment.
pub fn media_from_html(html: &str, kind: MediaKind) -> Option<String> {
    let fragment = Html::parse_fragment(html);
    let selector = Selector::parse(kind.tag()).ok()?;
    let src = fragment
        .select(&selector)
        .find_map(|el| el.value().attr("src"))
        .map(String::from);
    src
}

/// Make a media URL absolute.
///
/// Absolute and protocol-relative URLs pass through. Root-relative URLs get
/// the feed's origin. Anything else is appended to the item link (or guid)
/// as is; when the link ends in `/` its directory part is inserted in
/// between.
pub fn resolve_media_url(feed_url: &str, item: &RawItem, url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    if url.starts_with("//") || lower.starts_with("http://") || lower.starts_with("https://") {
        return url.to_string();
    }
    if url.starts_with('/') {
        return format!("{}{}", url_origin(feed_url), url);
    }
    match item.link.as_deref().or(item.guid.as_deref()) {
        Some(prefix) => {
            let directory = if prefix.ends_with('/') {
                let parts: Vec<&str> = prefix.split('/').collect();
                format!("{}/", parts[..parts.len() - 1].join("/"))
            } else {
                String::new()
            };
            format!("{}{}{}", prefix, directory, url)
        }
        None => url.to_string(),
    }
}

/// Find an image or video for an item: enclosure, then thumbnail (images
/// only), then the item's own markup, then the captured article HTML.
pub fn get_media(feed_url: &str, item: &RawItem, kind: MediaKind, article_html: Option<&str>) -> Option<String> {
    let url = item
        .enclosure
        .as_ref()
        .filter(|e| e.mime.starts_with(kind.mime_prefix()))
        .map(|e| e.url.clone())
        .or_else(|| match kind {
            MediaKind::Image => item.media_thumbnail.clone(),
            MediaKind::Video => None,
        })
        .or_else(|| derive_content(item).and_then(|html| media_from_html(&html, kind)))
        .or_else(|| article_html.and_then(|html| media_from_html(html, kind)))?;

    Some(resolve_media_url(feed_url, item, &url))
}

pub async fn reconcile_item(
    ctx: &ReconcileContext<'_>,
    feed: &Feed,
    item: &RawItem,
) -> Result<ReconcileOutcome, ReconcileError> {
    let mut draft = draft_from_item(feed.id, item)?;
    let stored = ctx.db.find_entry_by_guid(&draft.guid).await?;
    let changed = stored
        .as_ref()
        .map_or(true, |stored| check_entry_changed(&draft, stored));

    let mut degraded = false;
    if changed {
        if let Some(link) = draft.link.as_deref() {
            match fetch_article(ctx.client, link).await {
                Ok(article) => draft.html = Some(article.content),
                Err(e) => {
                    warn!(feed = %feed.url, guid = %draft.guid, error = %e, "Article extraction failed");
                    degraded = true;
                }
            }
        }
    }

    let html = draft
        .html
        .clone()
        .or_else(|| stored.as_ref().and_then(|s| s.html.clone()));
    draft.image = item
        .image
        .clone()
        .or_else(|| get_media(&feed.url, item, MediaKind::Image, html.as_deref()));
    let video_html = if draft.image.is_some() { None } else { html.as_deref() };
    draft.video = item
        .video
        .clone()
        .or_else(|| get_media(&feed.url, item, MediaKind::Video, video_html));
    draft.html = html;

    let (entry, change) = match stored {
        None => (ctx.db.create_entry(&draft).await?, Change::Created),
        Some(stored) => {
            let change = if changed { Change::Updated } else { Change::Unchanged };
            (ctx.db.update_entry(stored.id, &draft).await?, change)
        }
    };

    if let Some(image) = entry.image.as_deref() {
        let url = if image.starts_with("//") {
            format!("https:{}", image)
        } else {
            image.to_string()
        };
        match cache_entry_image(ctx.client, ctx.media, entry.feed_id, entry.id, &url).await {
            Ok(true) => debug!(guid = %entry.guid, "Cached entry image"),
            Ok(false) => {}
            Err(e) => warn!(guid = %entry.guid, image = %url, error = %e, "Failed to cache entry image"),
        }
    }

    Ok(ReconcileOutcome {
        entry,
        change,
        degraded,
    })
}
