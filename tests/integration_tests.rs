//! Integration tests for the feedsmith aggregator
//!
//! These tests exercise the full path from configuration files through
//! fetching, reconciliation and storage, up to the web interface.

use std::io::Write;
use tempfile::NamedTempFile;

mod common {
    use std::sync::Arc;
    use std::time::Duration;

    use feedsmith::config::{ConfigSource, FeedConfig, Prefs, StaticConfigSource};
    use feedsmith::db::Database;
    use feedsmith::fetcher::{Fetcher, FetcherSettings};
    use feedsmith::http::ReqwestClient;
    use feedsmith::media::{FsMediaStore, MediaStore};
    use feedsmith::routes::AppState;
    use tempfile::TempDir;

    /// Create a temporary directory for test databases
    pub fn create_temp_dir() -> TempDir {
        tempfile::tempdir().expect("Failed to create temp directory")
    }

    /// Create a test database path
    pub fn create_db_path(temp_dir: &TempDir) -> String {
        let db_path = temp_dir.path().join("test.db");
        format!("sqlite:{}?mode=rwc", db_path.display())
    }

    pub struct Stack {
        pub db: Arc<Database>,
        pub fetcher: Arc<Fetcher>,
        pub source: Arc<dyn ConfigSource>,
        pub media: Arc<dyn MediaStore>,
        pub dir: TempDir,
    }

    impl Stack {
        pub fn media_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("media")
        }

        pub fn app_state(&self) -> Arc<AppState> {
            Arc::new(AppState {
                db: self.db.clone(),
                fetcher: self.fetcher.clone(),
                config: self.source.clone(),
                media: self.media.clone(),
                prefs: Prefs::default(),
            })
        }
    }

    /// Everything main wires together, on a throwaway directory.
    pub async fn create_stack(feeds: Vec<FeedConfig>) -> Stack {
        let dir = create_temp_dir();
        let db = Database::new(&create_db_path(&dir)).await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);

        let media: Arc<dyn MediaStore> = Arc::new(FsMediaStore::new(dir.path().join("media")));
        let source: Arc<dyn ConfigSource> = Arc::new(StaticConfigSource::new(feeds));
        let fetcher = Arc::new(Fetcher::new(
            db.clone(),
            Arc::new(ReqwestClient::new(Duration::from_secs(5)).unwrap()),
            media.clone(),
            source.clone(),
            FetcherSettings::default(),
        ));

        Stack {
            db,
            fetcher,
            source,
            media,
            dir,
        }
    }
}

#[cfg(test)]
mod config_integration_tests {
    use super::*;
    use feedsmith::config::{AppConfig, ConfigSource, FeedKind, FeedStatus, FileConfigSource};
    use feedsmith::error::ConfigError;

    #[test]
    fn test_load_actual_feeds_config() {
        let config = AppConfig::load("feeds.toml");
        assert!(config.is_ok(), "Failed to load feeds.toml: {:?}", config.err());

        let config = config.unwrap();
        assert!(!config.feeds.is_empty(), "feeds.toml should have at least one feed");
        assert!(config.refresh_interval > 0, "refresh_interval should be positive");
    }

    #[test]
    fn test_actual_feeds_resolve_with_system_profiles() {
        let source = FileConfigSource::new("feeds.toml", "res/profiles.toml");
        let feeds = source.load_feeds().unwrap();

        let twir = feeds.iter().find(|f| f.name.as_deref() == Some("This Week in Rust")).unwrap();
        assert_eq!(twir.url, "https://this-week-in-rust.org/atom.xml");

        let lobsters = feeds.iter().find(|f| f.profile.as_deref() == Some("lobsters")).unwrap();
        assert_eq!(lobsters.kind, FeedKind::Html);
        assert_eq!(lobsters.status, FeedStatus::Hidden);
        assert!(lobsters.queries.entries.is_some());
        assert!(lobsters.queries.entry_link.is_some());
    }

    #[test]
    fn test_profile_layers_from_files() {
        let data_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            data_dir.path().join("profiles.toml"),
            "[blog]\ncss_entry_title = \"h1.user\"\n",
        )
        .unwrap();

        let mut system = NamedTempFile::new().unwrap();
        system
            .write_all(b"[blog]\ncss_entries = \"article\"\ncss_entry_link = \"a\"\ncss_entry_title = \"h2\"\ncss_entry_author = \".by\"\n")
            .unwrap();

        let mut settings = NamedTempFile::new().unwrap();
        write!(
            settings,
            "data_dir = {:?}\n\n[[feeds]]\nurl = \"blog.example/posts\"\ntype = \"html\"\nprofile = \"blog\"\ncss_entry_author = \".inline\"\n",
            data_dir.path().display().to_string()
        )
        .unwrap();

        let source = FileConfigSource::new(settings.path(), system.path());
        let feeds = source.load_feeds().unwrap();
        assert_eq!(feeds.len(), 1);

        let queries = &feeds[0].queries;
        assert_eq!(queries.entries.as_deref(), Some("article"));
        assert_eq!(queries.entry_title.as_deref(), Some("h1.user"));
        assert_eq!(queries.entry_author.as_deref(), Some(".inline"));
        assert_eq!(feeds[0].url, "https://blog.example/posts");
    }

    #[test]
    fn test_source_rereads_on_every_call() {
        let mut settings = NamedTempFile::new().unwrap();
        settings
            .write_all(b"[[feeds]]\nurl = \"https://one.example/rss\"\n")
            .unwrap();
        let source = FileConfigSource::new(settings.path(), "does-not-exist.toml");
        assert_eq!(source.load_feeds().unwrap().len(), 1);

        settings
            .write_all(b"\n[[feeds]]\nurl = \"https://two.example/rss\"\n")
            .unwrap();
        settings.flush().unwrap();
        assert_eq!(source.load_feeds().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_profile_skips_only_that_feed() {
        let mut settings = NamedTempFile::new().unwrap();
        settings
            .write_all(b"[[feeds]]\nurl = \"https://one.example/rss\"\nprofile = \"nope\"\n\n[[feeds]]\nurl = \"https://two.example/rss\"\n")
            .unwrap();
        let source = FileConfigSource::new(settings.path(), "res/profiles.toml");
        let feeds = source.load_feeds().unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].url, "https://two.example/rss");
    }

    #[test]
    fn test_unreadable_settings_is_error() {
        let source = FileConfigSource::new("does-not-exist/feeds.toml", "res/profiles.toml");
        assert!(matches!(source.load_feeds(), Err(ConfigError::Io { .. })));
    }
}

#[cfg(test)]
mod database_integration_tests {
    use super::common::*;
    use feedsmith::config::FeedConfig;
    use feedsmith::db::{Database, EntryDraft};

    #[tokio::test]
    async fn test_database_persistence() {
        let temp_dir = create_temp_dir();
        let db_url = create_db_path(&temp_dir);

        {
            let db = Database::new(&db_url).await.unwrap();
            db.initialize().await.unwrap();
            db.sync_feeds(&[FeedConfig::new("https://persistent.example/rss")])
                .await
                .unwrap();

            let feeds = db.get_all_feeds().await.unwrap();
            db.create_entry(&EntryDraft {
                feed_id: feeds[0].id,
                guid: "persistent-guid".into(),
                title: Some("Persistent Article".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        // Reopen without reinitializing
        {
            let db = Database::new(&db_url).await.unwrap();
            let feeds = db.get_all_feeds().await.unwrap();
            assert_eq!(feeds.len(), 1);

            let entries = db.get_entries_for_feed(feeds[0].id, 10).await.unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].title.as_deref(), Some("Persistent Article"));
        }
    }

    #[tokio::test]
    async fn test_resync_keeps_fetched_state() {
        let temp_dir = create_temp_dir();
        let db = Database::new(&create_db_path(&temp_dir)).await.unwrap();
        db.initialize().await.unwrap();

        let config = FeedConfig::new("https://feed.example/rss");
        db.sync_feeds(&[config.clone()]).await.unwrap();
        let feed = db.get_all_feeds().await.unwrap().remove(0);
        db.update_feed_after_fetch(feed.id, Some("Reported"), None, "OK", None)
            .await
            .unwrap();

        db.sync_feeds(&[config]).await.unwrap();
        let feeds = db.get_all_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].name.as_deref(), Some("Reported"));
        assert_eq!(feeds[0].last_status.as_deref(), Some("OK"));
    }
}

#[cfg(test)]
mod pipeline_integration_tests {
    use super::common::*;
    use feedsmith::config::{FeedConfig, FeedKind};
    use feedsmith::fetcher::UpdateOutcome;
    use feedsmith::media::MediaStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article(text: &str) -> String {
        format!(
            "<html><head><title>{0}</title></head><body><article><p>{1}</p></article></body></html>",
            text,
            text.repeat(20)
        )
    }

    #[tokio::test]
    async fn test_html_feed_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><title>Listing</title></head><body>
                <div class="e"><a href="/p/1">T1</a></div>
                <div class="e"><a href="/p/2">T2</a></div>
                <div class="e"><span>no link</span></div>
                </body></html>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(article("First post. ")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(article("Second post. ")))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/list", server.uri());
        let mut config = FeedConfig::new(&url);
        config.kind = FeedKind::Html;
        config.queries.entries = Some(".e".into());
        config.queries.entry_link = Some("a::attr(href)".into());
        config.queries.entry_title = Some("a::text".into());

        let stack = create_stack(vec![config]).await;
        let report = stack.fetcher.sweep(false).await.unwrap();
        assert_eq!(report.updated(), 1);

        let feed = stack.db.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(feed.name.as_deref(), Some("Listing"));
        assert_eq!(stack.db.get_entry_count_for_feed(feed.id).await.unwrap(), 2);

        let guid = format!("{}/p/1", server.uri());
        let entry = stack.db.find_entry_by_guid(&guid).await.unwrap().unwrap();
        assert_eq!(entry.link.as_deref(), Some(guid.as_str()));
        assert_eq!(entry.title.as_deref(), Some("T1"));
        assert!(entry.html.unwrap().contains("First post."));
    }

    #[tokio::test]
    async fn test_relative_image_joined_to_link_and_cached() {
        let server = MockServer::start().await;
        let link = format!("{}/posts/1", server.uri());
        let rss = format!(
            r#"<?xml version="1.0"?><rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
            <channel><title>Images</title>
            <item><guid>img-post</guid><title>Pic</title><link>{}</link>
            <content:encoded><![CDATA[<p>Look <img src="img.jpg"></p>]]></content:encoded></item>
            </channel></rss>"#,
            link
        );
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/posts/1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/posts/1img.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xffu8, 0xd8]))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed.xml", server.uri());
        let stack = create_stack(vec![FeedConfig::new(&url)]).await;
        stack.fetcher.sweep(false).await.unwrap();

        let entry = stack.db.find_entry_by_guid("img-post").await.unwrap().unwrap();
        assert_eq!(entry.image, Some(format!("{}img.jpg", link)));
        assert!(entry.html.is_none());

        let cached = stack.media.path_for(entry.feed_id, entry.id, ".jpg");
        assert!(stack.media.exists(&cached).await);
        assert!(cached.starts_with(stack.media_dir()));
    }

    #[tokio::test]
    async fn test_second_sweep_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .and(wiremock::matchers::header("if-none-match", "\"abc\""))
            .respond_with(ResponseTemplate::new(304))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"abc\"")
                    .set_body_string(
                        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>C</title>
                        <item><guid>c1</guid><title>One</title></item></channel></rss>"#,
                    ),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed.xml", server.uri());
        let stack = create_stack(vec![FeedConfig::new(&url)]).await;

        stack.fetcher.sweep(false).await.unwrap();
        let before = stack.db.get_feed_by_url(&url).await.unwrap().unwrap();

        let report = stack.fetcher.sweep(false).await.unwrap();
        assert_eq!(report.outcome(&url), Some(&UpdateOutcome::NotModified));

        let after = stack.db.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(after.last_status, before.last_status);
        assert_eq!(after.etag.as_deref(), Some("\"abc\""));
    }

    #[tokio::test]
    async fn test_one_bad_feed_does_not_stop_sweep() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Good</title>
                <item><guid>g1</guid><title>Fine</title></item></channel></rss>"#,
            ))
            .mount(&server)
            .await;

        let good = format!("{}/good.xml", server.uri());
        let stack = create_stack(vec![
            FeedConfig::new("http://127.0.0.1:9/unreachable.xml"),
            FeedConfig::new(&good),
        ])
        .await;

        let report = stack.fetcher.sweep(false).await.unwrap();
        assert_eq!(report.updated(), 1);
        assert_eq!(report.failed(), 1);

        let bad = stack
            .db
            .get_feed_by_url("http://127.0.0.1:9/unreachable.xml")
            .await
            .unwrap()
            .unwrap();
        assert!(bad.last_status.unwrap().starts_with("Error:"));
        assert!(stack.db.find_entry_by_guid("g1").await.unwrap().is_some());
    }
}

#[cfg(test)]
mod server_integration_tests {
    use super::common::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use feedsmith::config::FeedConfig;
    use feedsmith::routes::build_router;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_health() {
        let stack = create_stack(Vec::new()).await;
        let server = TestServer::new(build_router(stack.app_state(), &stack.media_dir())).unwrap();

        let response = server.get("/health").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }

    #[tokio::test]
    async fn test_swept_entries_are_served() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Served Feed</title>
                <item><guid>s1</guid><title>Served Entry</title><description>Body text</description></item>
                </channel></rss>"#,
            ))
            .mount(&upstream)
            .await;

        let url = format!("{}/rss", upstream.uri());
        let stack = create_stack(vec![FeedConfig::new(&url)]).await;
        stack.fetcher.sweep(false).await.unwrap();
        let server = TestServer::new(build_router(stack.app_state(), &stack.media_dir())).unwrap();

        let index = server.get("/").await;
        index.assert_status_ok();
        assert!(index.text().contains("Served Entry"));
        assert!(index.text().contains("Served Feed"));

        let entry = stack.db.find_entry_by_guid("s1").await.unwrap().unwrap();
        let page = server.get(&format!("/entry/{}", entry.id)).await;
        page.assert_status_ok();
        assert!(page.text().contains("Body text"));

        server.get("/entry/12345").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_media_served() {
        let stack = create_stack(Vec::new()).await;
        let dir = stack.media_dir().join("1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("icon.png"), b"icon-bytes").unwrap();

        let server = TestServer::new(build_router(stack.app_state(), &stack.media_dir())).unwrap();
        let response = server.get("/media/1/icon.png").await;
        response.assert_status_ok();
        assert_eq!(response.as_bytes().as_ref(), b"icon-bytes");
    }
}
