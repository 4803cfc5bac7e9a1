use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Problems with the feed list, settings or profile files.
///
/// These are fatal to whatever operation hit them: a sweep whose
/// configuration cannot be read does not run at all.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("feed #{index} has no url")]
    MissingUrl { index: usize },
    #[error("feed {feed} references unknown profile '{profile}'")]
    UnknownProfile { feed: String, profile: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(StatusCode),
}

/// Failure of one feed update cycle. Always converted into a status
/// string at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed parsing error: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
    #[error("empty HTML document")]
    EmptyDocument,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("item has neither guid nor link")]
    MissingGuid,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not read {url}: {reason}")]
    Extract { url: String, reason: String },
    #[error("no readable content at {0}")]
    NoContent(String),
}
