use sqlx::{sqlite::SqlitePoolOptions, FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::config::FeedConfig;
use crate::http::CacheTokens;

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_status: Option<String>,
}

impl Feed {
    pub fn cache_tokens(&self) -> CacheTokens {
        CacheTokens {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub link: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub html: Option<String>,
    pub image: Option<String>,
    pub video: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
}

/// Column values for an entry insert or update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryDraft {
    pub feed_id: i64,
    pub guid: String,
    pub link: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub html: Option<String>,
    pub image: Option<String>,
    pub video: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                name TEXT,
                description TEXT,
                icon TEXT,
                etag TEXT,
                last_modified TEXT,
                last_status TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id),
                guid TEXT NOT NULL UNIQUE,
                link TEXT,
                title TEXT,
                summary TEXT,
                content TEXT,
                html TEXT,
                image TEXT,
                video TEXT,
                author TEXT,
                published TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_feed_published
            ON entries(feed_id, published DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Make sure every configured feed has a row. Existing rows keep their
    /// fetched state.
    pub async fn sync_feeds(&self, configs: &[FeedConfig]) -> anyhow::Result<()> {
        for config in configs {
            sqlx::query(
                r#"
                INSERT INTO feeds (url, icon)
                VALUES (?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    icon = COALESCE(excluded.icon, feeds.icon)
                "#,
            )
            .bind(&config.url)
            .bind(&config.icon)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn get_all_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed(&self, feed_id: i64) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn update_feed_status(&self, feed_id: i64, status: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE feeds SET last_status = ? WHERE id = ?")
            .bind(status)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a successful fetch. Missing name/description keep the stored
    /// value; cache tokens are only written when `tokens` is given.
    pub async fn update_feed_after_fetch(
        &self,
        feed_id: i64,
        name: Option<&str>,
        description: Option<&str>,
        status: &str,
        tokens: Option<&CacheTokens>,
    ) -> anyhow::Result<()> {
        match tokens {
            Some(tokens) => {
                sqlx::query(
                    r#"
                    UPDATE feeds
                    SET name = COALESCE(?, name),
                        description = COALESCE(?, description),
                        last_status = ?,
                        etag = ?,
                        last_modified = ?
                    WHERE id = ?
                    "#,
                )
                .bind(name)
                .bind(description)
                .bind(status)
                .bind(&tokens.etag)
                .bind(&tokens.last_modified)
                .bind(feed_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE feeds
                    SET name = COALESCE(?, name),
                        description = COALESCE(?, description),
                        last_status = ?
                    WHERE id = ?
                    "#,
                )
                .bind(name)
                .bind(description)
                .bind(status)
                .bind(feed_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn find_entry_by_guid(&self, guid: &str) -> anyhow::Result<Option<Entry>> {
        let entry = sqlx::query_as::<_, Entry>("SELECT * FROM entries WHERE guid = ?")
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    pub async fn get_entry(&self, entry_id: i64) -> anyhow::Result<Option<Entry>> {
        let entry = sqlx::query_as::<_, Entry>("SELECT * FROM entries WHERE id = ?")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    pub async fn create_entry(&self, draft: &EntryDraft) -> anyhow::Result<Entry> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"
            INSERT INTO entries
                (feed_id, guid, link, title, summary, content, html, image, video, author, published)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(draft.feed_id)
        .bind(&draft.guid)
        .bind(&draft.link)
        .bind(&draft.title)
        .bind(&draft.summary)
        .bind(&draft.content)
        .bind(&draft.html)
        .bind(&draft.image)
        .bind(&draft.video)
        .bind(&draft.author)
        .bind(&draft.published)
        .fetch_one(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Update an entry in place. The guid is its identity and is never
    /// rewritten.
    pub async fn update_entry(&self, entry_id: i64, draft: &EntryDraft) -> anyhow::Result<Entry> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"
            UPDATE entries
            SET link = ?, title = ?, summary = ?, content = ?, html = ?,
                image = ?, video = ?, author = ?, published = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&draft.link)
        .bind(&draft.title)
        .bind(&draft.summary)
        .bind(&draft.content)
        .bind(&draft.html)
        .bind(&draft.image)
        .bind(&draft.video)
        .bind(&draft.author)
        .bind(&draft.published)
        .bind(entry_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn get_entries_for_feed(&self, feed_id: i64, limit: i64) -> anyhow::Result<Vec<Entry>> {
        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT * FROM entries
            WHERE feed_id = ?
            ORDER BY published DESC NULLS LAST, id DESC
            LIMIT ?
            "#,
        )
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Newest entries across all feeds except `exclude_feeds`.
    pub async fn get_latest_entries(&self, exclude_feeds: &[i64], limit: i64) -> anyhow::Result<Vec<Entry>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM entries");
        if !exclude_feeds.is_empty() {
            builder.push(" WHERE feed_id NOT IN (");
            let mut ids = builder.separated(", ");
            for id in exclude_feeds {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
        }
        builder.push(" ORDER BY published DESC NULLS LAST, id DESC LIMIT ");
        builder.push_bind(limit);

        let entries = builder
            .build_query_as::<Entry>()
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    pub async fn get_entry_count_for_feed(&self, feed_id: i64) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
