use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedsmith::config::{load_feeds_blocking, AppConfig, ConfigSource, FileConfigSource};
use feedsmith::db::Database;
use feedsmith::fetcher::{start_background_refresh, Fetcher, FetcherSettings};
use feedsmith::http::ReqwestClient;
use feedsmith::media::{FsMediaStore, MediaStore};
use feedsmith::routes::{build_router, AppState};

const DEFAULT_CONFIG_PATH: &str = "feeds.toml";
const SYSTEM_PROFILES_PATH: &str = "res/profiles.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedsmith=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("FEEDSMITH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load(&config_path)?;
    let source: Arc<dyn ConfigSource> =
        Arc::new(FileConfigSource::new(&config_path, SYSTEM_PROFILES_PATH));
    let feeds = load_feeds_blocking(&source).await?;
    info!("Loaded {} feeds from {}", feeds.len(), config_path);

    let media_dir = config.media_dir();
    tokio::fs::create_dir_all(&media_dir).await?;

    // Initialize database
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| config.default_database_url());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    db.sync_feeds(&feeds).await?;
    info!("Database initialized");

    let db = Arc::new(db);
    let media: Arc<dyn MediaStore> = Arc::new(FsMediaStore::new(&media_dir));
    let client = Arc::new(ReqwestClient::new(Duration::from_secs(config.request_timeout))?);

    // Create fetcher
    let fetcher = Arc::new(Fetcher::new(
        db.clone(),
        client,
        media.clone(),
        source.clone(),
        FetcherSettings {
            max_concurrent_updates: config.max_concurrent_updates,
            favicon_service: config.favicon_service.clone(),
        },
    ));

    // Start background refresh task
    let bg_fetcher = fetcher.clone();
    let refresh_interval = config.refresh_interval;
    tokio::spawn(async move {
        start_background_refresh(bg_fetcher, refresh_interval).await;
    });

    // Create app state
    let state = Arc::new(AppState {
        db: db.clone(),
        fetcher: fetcher.clone(),
        config: source,
        media,
        prefs: config.prefs.clone(),
    });

    let app = build_router(state, &media_dir);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server starting on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
