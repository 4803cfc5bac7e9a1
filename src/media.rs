//! Local cache of entry images and feed icons. Nothing is fetched twice.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use url::Url;

use crate::http::HttpClient;

const ICON_FILE: &str = "icon.png";

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// `<root>/<feed_id>/<entry_id><ext>`
    fn path_for(&self, feed_id: i64, entry_id: i64, ext: &str) -> PathBuf;
    fn icon_path(&self, feed_id: i64) -> PathBuf;
    async fn exists(&self, path: &Path) -> bool;
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    fn path_for(&self, feed_id: i64, entry_id: i64, ext: &str) -> PathBuf {
        self.root.join(feed_id.to_string()).join(format!("{}{}", entry_id, ext))
    }

    fn icon_path(&self, feed_id: i64) -> PathBuf {
        self.root.join(feed_id.to_string()).join(ICON_FILE)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await
    }
}

/// File extension of a media URL including the dot, query and fragment
/// ignored. Empty when the last path segment has none.
pub fn media_extension(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let segment = path.rsplit('/').next().unwrap_or_default();
    match segment.rfind('.') {
        Some(0) | None => String::new(),
        Some(i) => segment[i..].to_string(),
    }
}

/// Public URL path of a cached entry image.
pub fn media_web_path(feed_id: i64, entry_id: i64, media_url: &str) -> String {
    format!("/media/{}/{}{}", feed_id, entry_id, media_extension(media_url))
}

pub fn icon_web_path(feed_id: i64) -> String {
    format!("/media/{}/{}", feed_id, ICON_FILE)
}

/// Scheme and host of a URL, e.g. `https://site.example`.
pub fn url_origin(url: &str) -> String {
    url.split('/').take(3).collect::<Vec<_>>().join("/")
}

pub fn favicon_url(service: &str, feed_url: &str) -> String {
    let domain: String = url::form_urlencoded::byte_serialize(url_origin(feed_url).as_bytes()).collect();
    format!("{}?domain={}&sz=24", service, domain)
}

/// Download `url` to `path` unless it is already there. Returns whether a
/// download happened.
async fn fetch_once(client: &dyn HttpClient, store: &dyn MediaStore, url: &str, path: &Path) -> anyhow::Result<bool> {
    if store.exists(path).await {
        return Ok(false);
    }
    let response = client.get(url, &HeaderMap::new()).await?.error_for_status()?;
    store.write(path, &response.body).await?;
    Ok(true)
}

pub async fn cache_entry_image(
    client: &dyn HttpClient,
    store: &dyn MediaStore,
    feed_id: i64,
    entry_id: i64,
    image_url: &str,
) -> anyhow::Result<bool> {
    let path = store.path_for(feed_id, entry_id, &media_extension(image_url));
    fetch_once(client, store, image_url, &path).await
}

pub async fn cache_favicon(
    client: &dyn HttpClient,
    store: &dyn MediaStore,
    service: &str,
    feed_id: i64,
    feed_url: &str,
) -> anyhow::Result<bool> {
    let path = store.icon_path(feed_id);
    fetch_once(client, store, &favicon_url(service, feed_url), &path).await
}
