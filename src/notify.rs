//! Fire-and-forget progress events for whoever is listening.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    FeedsUpdateStarted,
    FeedsUpdateRunning { url: String },
    FeedEntryProcessing { url: String, guid: String },
    FeedUpdateStarted { url: String },
    FeedUpdateFinished { url: String },
    FeedsUpdateFinished,
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::FeedsUpdateStarted => "FEEDS_UPDATE_STARTED",
            Notification::FeedsUpdateRunning { .. } => "FEEDS_UPDATE_RUNNING",
            Notification::FeedEntryProcessing { .. } => "FEED_ENTRY_PROCESSING",
            Notification::FeedUpdateStarted { .. } => "FEED_UPDATE_STARTED",
            Notification::FeedUpdateFinished { .. } => "FEED_UPDATE_FINISHED",
            Notification::FeedsUpdateFinished => "FEEDS_UPDATE_FINISHED",
        }
    }
}

/// Cheap to clone; all clones share one channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Never blocks and never fails; with no subscribers the event is dropped.
    pub fn notify(&self, notification: Notification) {
        debug!(event = notification.name(), "notify");
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}
