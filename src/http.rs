use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use tracing::warn;

use crate::config::FeedConfig;
use crate::error::FetchError;

const APP_USER_AGENT: &str = "Feedsmith/0.1 (Feed Aggregator)";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn header(&self, name: HeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-success status into an error, 304 included.
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(FetchError::Status(self.status))
        }
    }
}

/// Plain GET. Non-success statuses are returned, not raised, so callers can
/// tell a 304 from a failure.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, headers: &HeaderMap) -> Result<FetchResponse, FetchError>;
}

pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(APP_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, headers: &HeaderMap) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url).headers(headers.clone()).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Conditional-fetch tokens stored for a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheTokens {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheTokens {
    pub fn from_response(response: &FetchResponse) -> Self {
        Self {
            etag: response.header(reqwest::header::ETAG),
            last_modified: response.header(reqwest::header::LAST_MODIFIED),
        }
    }
}

pub fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers
}

/// Request headers for one feed fetch.
///
/// Browser headers first, then the feed's own headers (which may override
/// them), then conditional headers unless `force` is set. Custom headers
/// that are not valid HTTP are skipped.
pub fn build_request_headers(feed: &FeedConfig, tokens: &CacheTokens, force: bool) -> HeaderMap {
    let mut headers = if feed.fake_browser {
        browser_headers()
    } else {
        HeaderMap::new()
    };

    for (name, value) in &feed.http_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(feed = %feed.url, header = %name, "Skipping invalid custom header"),
        }
    }

    if !force {
        if let Some(value) = tokens.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = tokens
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
    }

    headers
}
