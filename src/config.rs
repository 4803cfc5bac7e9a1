use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::error::ConfigError;

const DEFAULT_FAVICON_SERVICE: &str = "https://www.google.com/s2/favicons";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Refresh interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,
    /// Per-request network timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_favicon_service")]
    pub favicon_service: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub prefs: Prefs,
    #[serde(default)]
    pub feeds: Vec<FeedEntry>,
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_concurrent_updates() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    30
}

fn default_favicon_service() -> Option<String> {
    Some(DEFAULT_FAVICON_SERVICE.to_string())
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Prefs {
    /// Show the cached readable article instead of the feed content.
    #[serde(default = "default_true")]
    pub reader_mode: bool,
    /// Open links found in article HTML in a new tab.
    #[serde(default = "default_true")]
    pub external_html: bool,
    #[serde(default = "default_result_limit")]
    pub result_limit: i64,
}

fn default_true() -> bool {
    true
}

fn default_result_limit() -> i64 {
    30
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            reader_mode: true,
            external_html: true,
            result_limit: default_result_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    #[default]
    Standard,
    Html,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    #[default]
    Normal,
    Hidden,
    Disabled,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct QuerySet {
    #[serde(rename = "css_namespace")]
    pub namespace: Option<String>,
    #[serde(rename = "css_name")]
    pub name: Option<String>,
    #[serde(rename = "css_description")]
    pub description: Option<String>,
    #[serde(rename = "css_entries")]
    pub entries: Option<String>,
    #[serde(rename = "css_entry_link")]
    pub entry_link: Option<String>,
    #[serde(rename = "css_entry_title")]
    pub entry_title: Option<String>,
    #[serde(rename = "css_entry_summary")]
    pub entry_summary: Option<String>,
    #[serde(rename = "css_entry_content")]
    pub entry_content: Option<String>,
    #[serde(rename = "css_entry_author")]
    pub entry_author: Option<String>,
    #[serde(rename = "css_entry_published")]
    pub entry_published: Option<String>,
    #[serde(rename = "css_entry_image")]
    pub entry_image: Option<String>,
    #[serde(rename = "css_entry_video")]
    pub entry_video: Option<String>,
}

impl QuerySet {
    /// Field-by-field merge where every field set in `over` wins.
    pub fn merge(&self, over: &QuerySet) -> QuerySet {
        fn pick(base: &Option<String>, over: &Option<String>) -> Option<String> {
            over.clone().or_else(|| base.clone())
        }

        QuerySet {
            namespace: pick(&self.namespace, &over.namespace),
            name: pick(&self.name, &over.name),
            description: pick(&self.description, &over.description),
            entries: pick(&self.entries, &over.entries),
            entry_link: pick(&self.entry_link, &over.entry_link),
            entry_title: pick(&self.entry_title, &over.entry_title),
            entry_summary: pick(&self.entry_summary, &over.entry_summary),
            entry_content: pick(&self.entry_content, &over.entry_content),
            entry_author: pick(&self.entry_author, &over.entry_author),
            entry_published: pick(&self.entry_published, &over.entry_published),
            entry_image: pick(&self.entry_image, &over.entry_image),
            entry_video: pick(&self.entry_video, &over.entry_video),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeedEntry {
    pub url: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: FeedKind,
    #[serde(default)]
    pub status: FeedStatus,
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub fake_browser: bool,
    pub profile: Option<String>,
    #[serde(flatten)]
    pub queries: QuerySet,
}

/// A feed descriptor with its profile defaults already applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedConfig {
    pub url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub kind: FeedKind,
    pub status: FeedStatus,
    pub http_headers: BTreeMap<String, String>,
    pub fake_browser: bool,
    pub profile: Option<String>,
    pub queries: QuerySet,
}

impl FeedConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_url(url),
            ..Default::default()
        }
    }
}

pub type Profiles = HashMap<String, QuerySet>;

/// Prefix scheme-less URLs with `https://`.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_profiles(path: &Path) -> Result<Profiles, ConfigError> {
    if !path.exists() {
        return Ok(Profiles::new());
    }
    let content = read_file(path)?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve one feed entry: system profile, then user profile, then the
/// inline settings, each layer overriding the previous field by field.
pub fn resolve_feed(
    index: usize,
    entry: &FeedEntry,
    system: &Profiles,
    user: &Profiles,
) -> Result<FeedConfig, ConfigError> {
    let url = entry
        .url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .map(normalize_url)
        .ok_or(ConfigError::MissingUrl { index })?;

    let queries = match &entry.profile {
        Some(profile) => {
            let (sys, usr) = (system.get(profile), user.get(profile));
            if sys.is_none() && usr.is_none() {
                return Err(ConfigError::UnknownProfile {
                    feed: url,
                    profile: profile.clone(),
                });
            }
            let defaults = QuerySet::default();
            sys.unwrap_or(&defaults)
                .merge(usr.unwrap_or(&defaults))
                .merge(&entry.queries)
        }
        None => entry.queries.clone(),
    };

    Ok(FeedConfig {
        url,
        name: entry.name.clone(),
        description: entry.description.clone(),
        icon: entry.icon.clone(),
        kind: entry.kind,
        status: entry.status,
        http_headers: entry.http_headers.clone(),
        fake_browser: entry.fake_browser,
        profile: entry.profile.clone(),
        queries,
    })
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read_file(path)?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Feeds that fail to resolve are logged and left out.
    pub fn resolve_feeds(&self, system: &Profiles, user: &Profiles) -> Vec<FeedConfig> {
        self.feeds
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match resolve_feed(i, entry, system, user) {
                Ok(feed) => Some(feed),
                Err(e) => {
                    warn!(error = %e, "Skipping feed");
                    None
                }
            })
            .collect()
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    pub fn user_profiles_path(&self) -> PathBuf {
        self.data_dir.join("profiles.toml")
    }

    pub fn default_database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.data_dir.join("feedsmith.db").display())
    }
}

/// Must not cache between calls.
pub trait ConfigSource: Send + Sync {
    fn load_feeds(&self) -> Result<Vec<FeedConfig>, ConfigError>;
}

/// [`ConfigSource::load_feeds`] on the blocking pool.
pub async fn load_feeds_blocking(source: &Arc<dyn ConfigSource>) -> anyhow::Result<Vec<FeedConfig>> {
    let source = Arc::clone(source);
    Ok(tokio::task::spawn_blocking(move || source.load_feeds()).await??)
}

pub struct FileConfigSource {
    config_path: PathBuf,
    system_profiles: PathBuf,
}

impl FileConfigSource {
    pub fn new(config_path: impl Into<PathBuf>, system_profiles: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            system_profiles: system_profiles.into(),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load_feeds(&self) -> Result<Vec<FeedConfig>, ConfigError> {
        let config = AppConfig::load(&self.config_path)?;
        let system = load_profiles(&self.system_profiles)?;
        let user = load_profiles(&config.user_profiles_path())?;
        Ok(config.resolve_feeds(&system, &user))
    }
}

pub struct StaticConfigSource {
    feeds: Vec<FeedConfig>,
}

impl StaticConfigSource {
    pub fn new(feeds: Vec<FeedConfig>) -> Self {
        Self { feeds }
    }
}

impl ConfigSource for StaticConfigSource {
    fn load_feeds(&self) -> Result<Vec<FeedConfig>, ConfigError> {
        Ok(self.feeds.clone())
    }
}
