//! Display-ready views of stored feeds and entries.
//!
//! Everything here is pure: callers look up what is cached on disk and pass
//! the answer in, and every function returns a fresh value.

use chrono::{DateTime, Utc};
use url::Url;

use crate::config::{FeedConfig, FeedStatus};
use crate::dates::{format_relative, parse_date};
use crate::db::{Entry, Feed};
use crate::media::{icon_web_path, media_web_path};
use crate::reader::{sanitize_html, SanitizeOptions};

const YOUTUBE_PREFIX: &str = "https://www.youtube.com/";
const YOUTUBE_EMBED: &str = "https://www.youtube-nocookie.com/embed/";

/// URL-safe identifier for a feed URL.
pub fn slugify_url(url: &str) -> String {
    let lower = url.to_lowercase();
    let stripped = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);

    stripped
        .chars()
        .filter_map(|c| match c {
            '/' | '?' | '=' | '&' => Some('-'),
            'a'..='z' | '0'..='9' | '-' | '.' => Some(c),
            _ => None,
        })
        .collect()
}

/// Privacy-enhanced player URL for YouTube watch links.
pub fn youtube_embed(link: &str) -> Option<String> {
    if !link.starts_with(YOUTUBE_PREFIX) {
        return None;
    }
    let last = link.rsplit('/').next().unwrap_or_default();
    let mut tokens = last.split('=');
    let first = tokens.next().unwrap_or_default();
    let id = tokens.next().unwrap_or(first);
    let id = id.split('&').next().unwrap_or_default();
    if id.is_empty() {
        return None;
    }
    Some(format!("{}{}", YOUTUBE_EMBED, id))
}

/// Lenient boolean for query parameters. Unknown values are `None`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedView {
    pub id: i64,
    pub url: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub status: FeedStatus,
    pub last_status: Option<String>,
}

impl FeedView {
    /// Configured name and icon win over what the feed itself reported; a
    /// cached favicon wins over both icons.
    pub fn build(feed: &Feed, config: Option<&FeedConfig>, icon_cached: bool) -> Self {
        let name = config
            .and_then(|c| c.name.clone())
            .or_else(|| feed.name.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| feed.url.clone());
        let description = config
            .and_then(|c| c.description.clone())
            .or_else(|| feed.description.clone());
        let icon = if icon_cached {
            Some(icon_web_path(feed.id))
        } else {
            config.and_then(|c| c.icon.clone()).or_else(|| feed.icon.clone())
        };

        Self {
            id: feed.id,
            url: feed.url.clone(),
            slug: slugify_url(&feed.url),
            name,
            description,
            icon,
            status: config.map(|c| c.status).unwrap_or_default(),
            last_status: feed.last_status.clone(),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.status != FeedStatus::Normal
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryView {
    pub id: i64,
    pub feed_id: i64,
    pub feed_name: String,
    pub feed_slug: String,
    pub link: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub html: Option<String>,
    pub image: Option<String>,
    pub video: Option<String>,
    pub embed: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
    pub published_iso: Option<String>,
}

impl EntryView {
    pub fn build(entry: &Entry, feed: &FeedView, image_cached: bool, now: DateTime<Utc>, external_links: bool) -> Self {
        let link = entry.link.clone().unwrap_or_else(|| entry.guid.clone());
        let base_url = Url::parse(&link).ok();

        let parsed = entry.published.as_deref().and_then(parse_date);
        let published = match parsed {
            Some(dt) => Some(format_relative(dt, now)),
            None => entry.published.clone(),
        };

        let image = match entry.image.as_deref() {
            Some(image) if image_cached => Some(media_web_path(entry.feed_id, entry.id, image)),
            other => other.map(String::from),
        };

        let content = entry.content.as_deref().map(|content| {
            sanitize_html(
                content,
                &SanitizeOptions {
                    base_url: base_url.clone(),
                    external_links: false,
                },
            )
        });
        let html = entry.html.as_deref().map(|html| {
            sanitize_html(
                html,
                &SanitizeOptions {
                    base_url: base_url.clone(),
                    external_links,
                },
            )
        });

        Self {
            id: entry.id,
            feed_id: entry.feed_id,
            feed_name: feed.name.clone(),
            feed_slug: feed.slug.clone(),
            embed: youtube_embed(&link),
            link,
            title: entry
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "Untitled".to_string()),
            summary: entry.summary.clone(),
            content,
            html,
            image,
            video: entry.video.clone(),
            author: entry.author.clone(),
            published,
            published_iso: parsed.map(|dt| dt.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn feed() -> Feed {
        Feed {
            id: 2,
            url: "https://blog.example/feed.xml".into(),
            name: Some("Reported".into()),
            description: Some("From the feed".into()),
            icon: None,
            etag: None,
            last_modified: None,
            last_status: Some("OK".into()),
        }
    }

    fn entry() -> Entry {
        Entry {
            id: 9,
            feed_id: 2,
            guid: "https://blog.example/p/1".into(),
            link: None,
            title: None,
            summary: Some("sum".into()),
            content: Some(r#"<p onclick="x()">Hi <a href="/about">about</a></p><script>bad()</script>"#.into()),
            html: Some(r#"<p><a href="https://else.example">out</a></p>"#.into()),
            image: Some("https://cdn.example/pic.jpg?w=2".into()),
            video: None,
            author: None,
            published: Some("2024-12-09T12:00:00Z".into()),
        }
    }

    mod slug_tests {
        use super::*;

        #[test]
        fn test_slugify_url() {
            assert_eq!(slugify_url("https://Blog.Example/feed.xml"), "blog.example-feed.xml");
            assert_eq!(slugify_url("http://a.example/rss?x=1&y=2"), "a.example-rss-x-1-y-2");
            assert_eq!(slugify_url("https://a.example/~user/feed_1"), "a.example-user-feed1");
        }

        #[test]
        fn test_youtube_embed() {
            assert_eq!(
                youtube_embed("https://www.youtube.com/watch?v=abc123").as_deref(),
                Some("https://www.youtube-nocookie.com/embed/abc123")
            );
            assert_eq!(
                youtube_embed("https://www.youtube.com/watch?v=abc123&t=10").as_deref(),
                Some("https://www.youtube-nocookie.com/embed/abc123")
            );
            assert_eq!(
                youtube_embed("https://www.youtube.com/shorts/xyz").as_deref(),
                Some("https://www.youtube-nocookie.com/embed/xyz")
            );
            assert_eq!(youtube_embed("https://vimeo.com/1"), None);
        }

        #[test]
        fn test_parse_bool() {
            assert_eq!(parse_bool("Yes"), Some(true));
            assert_eq!(parse_bool("0"), Some(false));
            assert_eq!(parse_bool("maybe"), None);
        }
    }

    mod feed_view_tests {
        use super::*;

        #[test]
        fn test_configured_name_wins() {
            let mut config = FeedConfig::new("https://blog.example/feed.xml");
            config.name = Some("Mine".into());
            config.status = FeedStatus::Hidden;
            let view = FeedView::build(&feed(), Some(&config), false);
            assert_eq!(view.name, "Mine");
            assert_eq!(view.slug, "blog.example-feed.xml");
            assert!(view.is_hidden());
        }

        #[test]
        fn test_falls_back_to_reported_then_url() {
            let view = FeedView::build(&feed(), None, false);
            assert_eq!(view.name, "Reported");
            assert!(!view.is_hidden());

            let mut bare = feed();
            bare.name = None;
            assert_eq!(FeedView::build(&bare, None, false).name, "https://blog.example/feed.xml");
        }

        #[test]
        fn test_cached_icon() {
            let mut config = FeedConfig::new("https://blog.example/feed.xml");
            config.icon = Some("https://blog.example/icon.svg".into());
            assert_eq!(
                FeedView::build(&feed(), Some(&config), false).icon.as_deref(),
                Some("https://blog.example/icon.svg")
            );
            assert_eq!(
                FeedView::build(&feed(), Some(&config), true).icon.as_deref(),
                Some("/media/2/icon.png")
            );
        }
    }

    mod entry_view_tests {
        use super::*;

        #[test]
        fn test_build_entry_view() {
            let now = parse_date("2024-12-09T15:00:00Z").unwrap();
            let feed_view = FeedView::build(&feed(), None, false);
            let view = EntryView::build(&entry(), &feed_view, true, now, true);

            assert_eq!(view.link, "https://blog.example/p/1");
            assert_eq!(view.title, "Untitled");
            assert_eq!(view.published.as_deref(), Some("about 3 hours ago"));
            assert_eq!(view.published_iso.as_deref(), Some("2024-12-09T12:00:00+00:00"));
            assert_eq!(view.image.as_deref(), Some("/media/2/9.jpg"));
            assert_eq!(view.feed_name, "Reported");

            let content = view.content.unwrap();
            assert!(!content.contains("onclick"));
            assert!(!content.contains("bad()"));
            assert!(content.contains(r#"href="https://blog.example/about""#));

            let html = view.html.unwrap();
            assert!(html.contains(r#"target="_blank""#));
            assert!(html.contains(r#"rel="nofollow noopener""#));
        }

        #[test]
        fn test_uncached_image_and_raw_date() {
            let mut raw = entry();
            raw.published = Some("sometime".into());
            let now = Utc::now();
            let feed_view = FeedView::build(&feed(), None, false);
            let view = EntryView::build(&raw, &feed_view, false, now + Duration::hours(1), false);

            assert_eq!(view.image.as_deref(), Some("https://cdn.example/pic.jpg?w=2"));
            assert_eq!(view.published.as_deref(), Some("sometime"));
            assert!(view.published_iso.is_none());
            assert!(!view.html.unwrap().contains("_blank"));
        }

        #[test]
        fn test_youtube_link_gets_embed() {
            let mut raw = entry();
            raw.link = Some("https://www.youtube.com/watch?v=vid42".into());
            let feed_view = FeedView::build(&feed(), None, false);
            let view = EntryView::build(&raw, &feed_view, false, Utc::now(), false);
            assert_eq!(view.embed.as_deref(), Some("https://www.youtube-nocookie.com/embed/vid42"));
        }
    }
}
