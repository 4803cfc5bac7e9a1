use std::collections::HashSet;
use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error};

use crate::config::{load_feeds_blocking, ConfigSource, Prefs};
use crate::db::{Database, Entry};
use crate::fetcher::Fetcher;
use crate::media::{media_extension, MediaStore};
use crate::view::{parse_bool, EntryView, FeedView};

pub struct AppState {
    pub db: Arc<Database>,
    pub fetcher: Arc<Fetcher>,
    pub config: Arc<dyn ConfigSource>,
    pub media: Arc<dyn MediaStore>,
    pub prefs: Prefs,
}

// Template structs
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub feeds: Vec<FeedView>,
    pub entries: Vec<EntryView>,
    pub refreshing: bool,
}

#[derive(Template)]
#[template(path = "feed.html")]
pub struct FeedTemplate {
    pub feeds: Vec<FeedView>,
    pub feed: FeedView,
    pub entries: Vec<EntryView>,
    pub refreshing: bool,
}

#[derive(Template)]
#[template(path = "entry.html")]
pub struct EntryTemplate {
    pub feeds: Vec<FeedView>,
    pub feed: FeedView,
    pub entry: EntryView,
    /// Captured article markup, when reader mode is on and one exists.
    pub reader_html: Option<String>,
    pub refreshing: bool,
}

#[derive(Template)]
#[template(path = "refresh_button.html")]
pub struct RefreshButtonTemplate {
    pub refreshing: bool,
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} not found")]
pub struct NotFound(pub &'static str);

// Custom error type
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(not_found) = self.0.downcast_ref::<NotFound>() {
            return (StatusCode::NOT_FOUND, not_found.to_string()).into_response();
        }
        error!(error = %self.0, "Request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: {}", self.0),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

pub fn build_router(state: Arc<AppState>, media_dir: &FsPath) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/feed/:slug", get(feed_page))
        .route("/feed/:slug/refresh", post(refresh_feed))
        .route("/entry/:id", get(entry_page))
        .route("/refresh", post(refresh))
        .route("/refresh/status", get(refresh_status))
        .route("/events", get(events))
        .route("/health", get(health))
        .nest_service("/media", ServeDir::new(media_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Views of every configured feed that has a stored row.
async fn load_feed_views(state: &AppState) -> anyhow::Result<Vec<FeedView>> {
    let configs = load_feeds_blocking(&state.config).await?;
    let mut views = Vec::new();
    for feed in state.db.get_all_feeds().await? {
        let Some(config) = configs.iter().find(|c| c.url == feed.url) else {
            continue;
        };
        let icon_cached = state.media.exists(&state.media.icon_path(feed.id)).await;
        views.push(FeedView::build(&feed, Some(config), icon_cached));
    }
    Ok(views)
}

async fn build_entry_views(
    state: &AppState,
    entries: Vec<Entry>,
    feeds: &[FeedView],
    external_links: bool,
) -> Vec<EntryView> {
    let now = Utc::now();
    let mut views = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(feed) = feeds.iter().find(|f| f.id == entry.feed_id) else {
            continue;
        };
        let image_cached = match entry.image.as_deref() {
            Some(image) => {
                let path = state
                    .media
                    .path_for(entry.feed_id, entry.id, &media_extension(image));
                state.media.exists(&path).await
            }
            None => false,
        };
        views.push(EntryView::build(&entry, feed, image_cached, now, external_links));
    }
    views
}

fn find_by_slug(feeds: &[FeedView], slug: &str) -> Result<FeedView, NotFound> {
    feeds
        .iter()
        .find(|f| f.slug == slug)
        .cloned()
        .ok_or(NotFound("Feed"))
}

// Route handlers
pub async fn index(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let feeds = load_feed_views(&state).await?;
    let visible: HashSet<i64> = feeds
        .iter()
        .filter(|f| !f.is_hidden())
        .map(|f| f.id)
        .collect();
    let exclude: Vec<i64> = state
        .db
        .get_all_feeds()
        .await?
        .into_iter()
        .map(|f| f.id)
        .filter(|id| !visible.contains(id))
        .collect();

    let entries = state
        .db
        .get_latest_entries(&exclude, state.prefs.result_limit)
        .await?;
    let entries = build_entry_views(&state, entries, &feeds, state.prefs.external_html).await;

    Ok(HtmlTemplate(IndexTemplate {
        feeds,
        entries,
        refreshing: state.fetcher.is_refreshing(),
    }))
}

pub async fn feed_page(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let feeds = load_feed_views(&state).await?;
    let feed = find_by_slug(&feeds, &slug)?;

    let entries = state
        .db
        .get_entries_for_feed(feed.id, state.prefs.result_limit)
        .await?;
    let entries = build_entry_views(&state, entries, &feeds, state.prefs.external_html).await;

    Ok(HtmlTemplate(FeedTemplate {
        feeds,
        feed,
        entries,
        refreshing: state.fetcher.is_refreshing(),
    }))
}

#[derive(Deserialize)]
pub struct EntryQuery {
    #[serde(default)]
    pub external_html: Option<String>,
}

pub async fn entry_page(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<i64>,
    Query(query): Query<EntryQuery>,
) -> Result<impl IntoResponse, AppError> {
    let entry = state
        .db
        .get_entry(entry_id)
        .await?
        .ok_or(NotFound("Entry"))?;
    let feeds = load_feed_views(&state).await?;
    let feed = feeds
        .iter()
        .find(|f| f.id == entry.feed_id)
        .cloned()
        .ok_or(NotFound("Feed"))?;

    let external_links = query
        .external_html
        .as_deref()
        .and_then(parse_bool)
        .unwrap_or(state.prefs.external_html);

    let entry = build_entry_views(&state, vec![entry], &feeds, external_links)
        .await
        .pop()
        .ok_or(NotFound("Entry"))?;
    let reader_html = if state.prefs.reader_mode {
        entry.html.clone()
    } else {
        None
    };

    Ok(HtmlTemplate(EntryTemplate {
        feeds,
        feed,
        entry,
        reader_html,
        refreshing: state.fetcher.is_refreshing(),
    }))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let fetcher = state.fetcher.clone();
    tokio::spawn(async move {
        if let Err(e) = fetcher.sweep(false).await {
            error!("Manual feed refresh failed: {}", e);
        }
    });

    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing: true }))
}

pub async fn refresh_feed(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let feeds = load_feed_views(&state).await?;
    let feed = find_by_slug(&feeds, &slug)?;

    let fetcher = state.fetcher.clone();
    tokio::spawn(async move {
        if let Err(e) = fetcher.refresh_feed_by_id(feed.id, true).await {
            error!(feed = %feed.url, error = %e, "Feed refresh failed");
        }
    });

    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing: true }))
}

pub async fn refresh_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let refreshing = state.fetcher.is_refreshing();
    Ok(HtmlTemplate(RefreshButtonTemplate { refreshing }))
}

/// Server-sent stream of update notifications.
pub async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.fetcher.notifier().subscribe();

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let notifications = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(notification) => Event::default()
                .event(notification.name())
                .json_data(&notification)
                .ok()
                .map(Ok),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                debug!(missed, "Event stream lagged");
                None
            }
        }
    });

    Sse::new(connected.chain(notifications)).keep_alive(KeepAlive::default())
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
