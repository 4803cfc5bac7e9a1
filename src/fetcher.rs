use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use tracing::{debug, error, info, warn};

use crate::config::{load_feeds_blocking, ConfigSource, FeedConfig, FeedKind, FeedStatus};
use crate::db::{Database, Feed};
use crate::error::UpdateError;
use crate::feed::{parse_standard_feed, RawFeed, RawItem};
use crate::html_feed::parse_html_feed;
use crate::http::{build_request_headers, CacheTokens, HttpClient};
use crate::media::{cache_favicon, MediaStore};
use crate::notify::{Notification, Notifier};
use crate::reconcile::{derive_guid, reconcile_item, Change, ReconcileContext};

/// Feed ids with an update in flight.
#[derive(Debug, Clone, Default)]
pub struct UpdateLocks {
    active: Arc<Mutex<HashSet<i64>>>,
}

impl UpdateLocks {
    /// Claim `feed_id`, or `None` if another update holds it. The claim is
    /// released when the guard drops.
    pub fn try_acquire(&self, feed_id: i64) -> Option<UpdateGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(feed_id) {
            return None;
        }
        Some(UpdateGuard {
            active: Arc::clone(&self.active),
            feed_id,
        })
    }

    pub fn is_held(&self, feed_id: i64) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&feed_id)
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

pub struct UpdateGuard {
    active: Arc<Mutex<HashSet<i64>>>,
    feed_id: i64,
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.feed_id);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Stored, but the article page could not be captured.
    pub degraded: usize,
    pub failed: usize,
}

impl UpdateSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.degraded == 0
    }

    pub fn status_line(&self) -> String {
        let mut status = format!(
            "OK: {} new, {} updated, {} unchanged",
            self.created, self.updated, self.unchanged
        );
        if self.failed > 0 {
            status.push_str(&format!(", {} failed", self.failed));
        }
        status
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Another update of the same feed was already running.
    Skipped,
    NotModified,
    Updated(UpdateSummary),
    /// The status line recorded on the feed.
    Failed(String),
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub outcomes: Vec<(String, UpdateOutcome)>,
}

impl SweepReport {
    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, UpdateOutcome::Updated(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UpdateOutcome::Failed(_)))
    }

    pub fn outcome(&self, url: &str) -> Option<&UpdateOutcome> {
        self.outcomes.iter().find(|(u, _)| u == url).map(|(_, o)| o)
    }

    fn count(&self, predicate: impl Fn(&UpdateOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| predicate(o)).count()
    }
}

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub max_concurrent_updates: usize,
    pub favicon_service: Option<String>,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent_updates: 4,
            favicon_service: None,
        }
    }
}

pub fn parse_feed_body(config: &FeedConfig, body: &[u8]) -> Result<RawFeed, UpdateError> {
    match config.kind {
        FeedKind::Standard => parse_standard_feed(body),
        FeedKind::Html => parse_html_feed(&String::from_utf8_lossy(body), config),
    }
}

pub struct Fetcher {
    db: Arc<Database>,
    client: Arc<dyn HttpClient>,
    media: Arc<dyn MediaStore>,
    config: Arc<dyn ConfigSource>,
    notifier: Notifier,
    locks: UpdateLocks,
    settings: FetcherSettings,
}

impl Fetcher {
    pub fn new(
        db: Arc<Database>,
        client: Arc<dyn HttpClient>,
        media: Arc<dyn MediaStore>,
        config: Arc<dyn ConfigSource>,
        settings: FetcherSettings,
    ) -> Self {
        Self {
            db,
            client,
            media,
            config,
            notifier: Notifier::new(),
            locks: UpdateLocks::default(),
            settings,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn is_refreshing(&self) -> bool {
        !self.locks.is_empty()
    }

    /// Update every enabled feed, re-reading the configuration first.
    ///
    /// Only a configuration or storage problem before the updates start is
    /// returned as an error; individual feed failures end up in the report.
    pub async fn sweep(&self, force: bool) -> anyhow::Result<SweepReport> {
        let configs = load_feeds_blocking(&self.config).await?;
        self.db.sync_feeds(&configs).await?;

        let mut rows: HashMap<String, Feed> = self
            .db
            .get_all_feeds()
            .await?
            .into_iter()
            .map(|feed| (feed.url.clone(), feed))
            .collect();

        let jobs: Vec<(FeedConfig, Feed)> = configs
            .into_iter()
            .filter(|config| config.status != FeedStatus::Disabled)
            .filter_map(|config| rows.remove(&config.url).map(|feed| (config, feed)))
            .collect();

        info!("Refreshing {} feeds", jobs.len());
        self.notifier.notify(Notification::FeedsUpdateStarted);

        let outcomes = stream::iter(jobs)
            .map(|(config, feed)| async move {
                let outcome = self.run_update(&config, &feed, force, false).await;
                (feed.url, outcome)
            })
            .buffer_unordered(self.settings.max_concurrent_updates.max(1))
            .collect::<Vec<_>>()
            .await;

        self.notifier.notify(Notification::FeedsUpdateFinished);
        let report = SweepReport { outcomes };
        info!(
            updated = report.updated(),
            failed = report.failed(),
            "Feed refresh complete"
        );
        Ok(report)
    }

    pub async fn update_feed(&self, config: &FeedConfig, feed: &Feed, force: bool) -> UpdateOutcome {
        self.run_update(config, feed, force, false).await
    }

    /// Update one feed on its own, announcing start and finish. `None` when
    /// no such feed is stored.
    pub async fn refresh_feed_by_id(&self, feed_id: i64, force: bool) -> anyhow::Result<Option<UpdateOutcome>> {
        let Some(feed) = self.db.get_feed(feed_id).await? else {
            return Ok(None);
        };
        let config = load_feeds_blocking(&self.config)
            .await?
            .into_iter()
            .find(|config| config.url == feed.url)
            .unwrap_or_else(|| FeedConfig::new(&feed.url));

        if config.status == FeedStatus::Disabled {
            debug!(feed = %feed.url, "Feed is disabled, not refreshing");
            return Ok(Some(UpdateOutcome::Skipped));
        }

        Ok(Some(self.run_update(&config, &feed, force, true).await))
    }

    async fn run_update(&self, config: &FeedConfig, feed: &Feed, force: bool, single: bool) -> UpdateOutcome {
        let Some(_guard) = self.locks.try_acquire(feed.id) else {
            debug!(feed = %feed.url, "Update already in progress, skipping");
            return UpdateOutcome::Skipped;
        };

        let url = feed.url.clone();
        self.notifier.notify(if single {
            Notification::FeedUpdateStarted { url }
        } else {
            Notification::FeedsUpdateRunning { url }
        });

        info!("Fetching feed: {}", feed.url);
        let outcome = match self.update_stages(config, feed, force).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(feed = %feed.url, error = %e, "Feed update failed");
                let status = format!("Error: {}", e);
                if let Err(e) = self.db.update_feed_status(feed.id, &status).await {
                    error!(feed = %feed.url, error = %e, "Failed to record feed status");
                }
                UpdateOutcome::Failed(status)
            }
        };

        if single {
            self.notifier.notify(Notification::FeedUpdateFinished {
                url: feed.url.clone(),
            });
        }

        outcome
    }

    async fn update_stages(&self, config: &FeedConfig, feed: &Feed, force: bool) -> Result<UpdateOutcome, UpdateError> {
        let headers = build_request_headers(config, &feed.cache_tokens(), force);
        let response = self.client.get(&feed.url, &headers).await?;
        if response.status == StatusCode::NOT_MODIFIED {
            info!(feed = %feed.url, "Feed not modified");
            return Ok(UpdateOutcome::NotModified);
        }
        let response = response.error_for_status()?;
        let tokens = CacheTokens::from_response(&response);

        let parsed = parse_feed_body(config, &response.body)?;
        let summary = self.reconcile_items(feed, &parsed.items).await;

        let tokens = summary.all_succeeded().then_some(&tokens);
        self.db
            .update_feed_after_fetch(
                feed.id,
                parsed.title.as_deref(),
                parsed.description.as_deref(),
                &summary.status_line(),
                tokens,
            )
            .await?;

        info!(
            feed = %feed.url,
            created = summary.created,
            updated = summary.updated,
            failed = summary.failed,
            "Feed updated"
        );
        self.cache_icon(feed).await;

        Ok(UpdateOutcome::Updated(summary))
    }

    async fn reconcile_items(&self, feed: &Feed, items: &[RawItem]) -> UpdateSummary {
        let ctx = ReconcileContext {
            db: &self.db,
            client: self.client.as_ref(),
            media: self.media.as_ref(),
        };

        let mut summary = UpdateSummary::default();
        for item in items {
            if let Ok(guid) = derive_guid(item) {
                self.notifier.notify(Notification::FeedEntryProcessing {
                    url: feed.url.clone(),
                    guid,
                });
            }

            match reconcile_item(&ctx, feed, item).await {
                Ok(outcome) => {
                    match outcome.change {
                        Change::Created => summary.created += 1,
                        Change::Updated => summary.updated += 1,
                        Change::Unchanged => summary.unchanged += 1,
                    }
                    if outcome.degraded {
                        summary.degraded += 1;
                    }
                }
                Err(e) => {
                    warn!(feed = %feed.url, error = %e, "Skipping entry");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn cache_icon(&self, feed: &Feed) {
        let Some(service) = self.settings.favicon_service.as_deref() else {
            return;
        };
        if let Err(e) = cache_favicon(self.client.as_ref(), self.media.as_ref(), service, feed.id, &feed.url).await {
            warn!(feed = %feed.url, error = %e, "Failed to cache feed icon");
        }
    }
}

pub async fn start_background_refresh(fetcher: Arc<Fetcher>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes.max(1) * 60);

    info!("Starting initial feed fetch");
    if let Err(e) = fetcher.sweep(false).await {
        error!("Initial feed fetch failed: {}", e);
    }

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled feed refresh");
        if let Err(e) = fetcher.sweep(false).await {
            error!("Scheduled feed refresh failed: {}", e);
        }
    }
}
