use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::domain::models::{Entry, Feed, NewEntry, NewFeed, SortBy};
use crate::error::RepositoryError;

const SMART_FALLBACK_LIMIT: i64 = 50;

/// The persistence capability seam: the Orchestrator depends on this trait,
/// not a concrete pool, so tests can substitute fakes and the concurrency
/// property tests can exercise the real SQLite-backed implementation as the
/// integration boundary.
#[async_trait]
pub trait FeedRepository: Send + Sync {
    async fn add_feed(&self, feed: NewFeed) -> Result<i64, RepositoryError>;
    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, RepositoryError>;
    async fn get_feeds(&self, active_only: bool) -> Result<Vec<Feed>, RepositoryError>;
    async fn remove_feed(&self, id: i64) -> Result<(), RepositoryError>;
    async fn update_feed(
        &self,
        id: i64,
        title: &str,
        site_link: Option<&str>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;
    async fn update_feed_cache(
        &self,
        id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
        last_fetched: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
    async fn update_feed_url(&self, id: i64, new_url: &str) -> Result<(), RepositoryError>;
    async fn update_feed_error(&self, id: i64, error_message: &str) -> Result<(), RepositoryError>;
    async fn clear_feed_error(&self, id: i64) -> Result<(), RepositoryError>;
    async fn upsert_entries(&self, feed_id: i64, entries: &[NewEntry]) -> Result<(), RepositoryError>;
    async fn get_recent_entries(&self, days: i64) -> Result<Vec<Entry>, RepositoryError>;
    async fn get_recent_entries_with_options(
        &self,
        days: i64,
        filter_by_first_seen: bool,
        sort_by: SortBy,
    ) -> Result<Vec<Entry>, RepositoryError>;
    async fn prune_old_entries(&self, days: i64) -> Result<u64, RepositoryError>;
}

/// SQLite-backed repository. Writes are serialised by SQLite's own
/// WAL-mode locking (see `database::setup_database`); this type adds no
/// additional write mutex on top since that would be redundant with a
/// connection-pool-per-writer model under WAL.
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteRepository { pool }
    }
}

fn row_to_feed(row: &sqlx::sqlite::SqliteRow) -> Result<Feed, RepositoryError> {
    Ok(Feed {
        id: row.try_get("id").map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        url: row.try_get("url").map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        title: row.try_get("title").map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        site_link: row.try_get("site_link").map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        feed_updated_at: parse_optional_ts(row, "feed_updated_at")?,
        etag: row.try_get("etag").map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        last_modified: row.try_get("last_modified").map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        last_fetched_at: parse_optional_ts(row, "last_fetched_at")?,
        next_fetch_at: parse_optional_ts(row, "next_fetch_at")?,
        fetch_error: row.try_get("fetch_error").map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        fetch_error_count: row
            .try_get("fetch_error_count")
            .map_err(|e| RepositoryError::from_sqlx("read feed row", e))?,
        created_at: parse_ts(row, "created_at", "feed.created_at")?,
    })
}

fn parse_optional_ts(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    let raw: Option<String> = row
        .try_get(column)
        .map_err(|e| RepositoryError::from_sqlx("read timestamp column", e))?;
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| RepositoryError::TimestampParse { context: column.to_string() }),
    }
}

fn parse_ts(row: &sqlx::sqlite::SqliteRow, column: &str, context: &str) -> Result<DateTime<Utc>, RepositoryError> {
    let raw: String = row.try_get(column).map_err(|e| RepositoryError::from_sqlx("read timestamp column", e))?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RepositoryError::TimestampParse { context: context.to_string() })
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<Entry, RepositoryError> {
    Ok(Entry {
        id: row.try_get("id").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        feed_id: row.try_get("feed_id").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        entry_id: row.try_get("entry_id").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        title: row.try_get("title").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        link: row.try_get("link").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        author: row.try_get("author").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        published_at: parse_ts(row, "published_at", "entry.published_at")?,
        updated_at: parse_ts(row, "updated_at", "entry.updated_at")?,
        content: row.try_get("content").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        summary: row.try_get("summary").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        content_type: row.try_get("content_type").map_err(|e| RepositoryError::from_sqlx("read entry row", e))?,
        first_seen_at: parse_ts(row, "first_seen_at", "entry.first_seen_at")?,
    })
}

#[async_trait]
impl FeedRepository for SqliteRepository {
    async fn add_feed(&self, feed: NewFeed) -> Result<i64, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO feeds (url, title, fetch_error_count) VALUES (?, ?, 0)",
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .execute(&self.pool)
        .await;

        match result {
            Ok(result) => Ok(result.last_insert_rowid()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(RepositoryError::DuplicateUrl)
            }
            Err(e) => Err(RepositoryError::from_sqlx("add_feed", e)),
        }
    }

    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("get_feed_by_url", e))?;

        row.as_ref().map(row_to_feed).transpose()
    }

    async fn get_feeds(&self, active_only: bool) -> Result<Vec<Feed>, RepositoryError> {
        let query = if active_only {
            "SELECT * FROM feeds WHERE fetch_error_count < 5 ORDER BY id"
        } else {
            "SELECT * FROM feeds ORDER BY id"
        };

        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("get_feeds", e))?;

        rows.iter().map(row_to_feed).collect()
    }

    async fn remove_feed(&self, id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("remove_feed", e))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::FeedNotFound);
        }
        Ok(())
    }

    async fn update_feed(
        &self,
        id: i64,
        title: &str,
        site_link: Option<&str>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE feeds SET title = ?, site_link = ?, feed_updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(site_link)
            .bind(updated_at.map(|dt| dt.to_rfc3339()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("update_feed", e))?;
        Ok(())
    }

    async fn update_feed_cache(
        &self,
        id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
        last_fetched: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE feeds SET etag = ?, last_modified = ?, last_fetched_at = ? WHERE id = ?")
            .bind(etag)
            .bind(last_modified)
            .bind(last_fetched.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("update_feed_cache", e))?;
        Ok(())
    }

    async fn update_feed_url(&self, id: i64, new_url: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE feeds SET url = ? WHERE id = ?")
            .bind(new_url)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("update_feed_url", e))?;
        Ok(())
    }

    async fn update_feed_error(&self, id: i64, error_message: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE feeds SET fetch_error = ?, fetch_error_count = fetch_error_count + 1 WHERE id = ?",
        )
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::from_sqlx("update_feed_error", e))?;
        Ok(())
    }

    async fn clear_feed_error(&self, id: i64) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE feeds SET fetch_error = NULL, fetch_error_count = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("clear_feed_error", e))?;
        Ok(())
    }

    async fn upsert_entries(&self, feed_id: i64, entries: &[NewEntry]) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryError::from_sqlx("upsert_entries begin", e))?;

        let now = Utc::now().to_rfc3339();

        for entry in entries {
            // `first_seen_at` is deliberately absent from the DO UPDATE SET
            // clause: on conflict it keeps the value from the original
            // insert, which is the write-once guarantee the entry model
            // requires.
            sqlx::query(
                "INSERT INTO entries \
                    (feed_id, entry_id, title, link, author, published_at, updated_at, content, summary, content_type, first_seen_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(feed_id, entry_id) DO UPDATE SET \
                    title = excluded.title, \
                    link = excluded.link, \
                    author = excluded.author, \
                    published_at = excluded.published_at, \
                    updated_at = excluded.updated_at, \
                    content = excluded.content, \
                    summary = excluded.summary, \
                    content_type = excluded.content_type",
            )
            .bind(feed_id)
            .bind(&entry.entry_id)
            .bind(&entry.title)
            .bind(&entry.link)
            .bind(&entry.author)
            .bind(entry.published_at.to_rfc3339())
            .bind(entry.updated_at.to_rfc3339())
            .bind(&entry.content)
            .bind(&entry.summary)
            .bind(&entry.content_type)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::from_sqlx("upsert_entries", e))?;
        }

        tx.commit().await.map_err(|e| RepositoryError::from_sqlx("upsert_entries commit", e))?;
        Ok(())
    }

    async fn get_recent_entries(&self, days: i64) -> Result<Vec<Entry>, RepositoryError> {
        self.get_recent_entries_with_options(days, false, SortBy::Published).await
    }

    async fn get_recent_entries_with_options(
        &self,
        days: i64,
        filter_by_first_seen: bool,
        sort_by: SortBy,
    ) -> Result<Vec<Entry>, RepositoryError> {
        // The age window and the display order are independent: this is what
        // lets "filter by when published, but order by when first seen" (the
        // anti-spam case — old entries a feed only just started advertising
        // still show up, but sorted by discovery order) be expressed.
        let filter_column = if filter_by_first_seen { "first_seen_at" } else { "published_at" };
        let sort_column = sort_by.column();
        let windowed_query = format!(
            "SELECT * FROM entries WHERE datetime({filter_column}) >= datetime('now', ? || ' days') ORDER BY {sort_column} DESC",
        );

        let rows = sqlx::query(&windowed_query)
            .bind(format!("-{days}"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("get_recent_entries_with_options", e))?;

        if !rows.is_empty() {
            return rows.iter().map(row_to_entry).collect();
        }

        // Smart fallback: an empty time-windowed result still returns the
        // most recent entries so the page is never blank while history
        // exists.
        let fallback_query = format!("SELECT * FROM entries ORDER BY {sort_column} DESC LIMIT ?");
        let rows = sqlx::query(&fallback_query)
            .bind(SMART_FALLBACK_LIMIT)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("get_recent_entries_with_options fallback", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn prune_old_entries(&self, days: i64) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM entries WHERE datetime(published_at) < datetime('now', ? || ' days')")
            .bind(format!("-{days}"))
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx("prune_old_entries", e))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::NewEntry;
    use chrono::Duration as ChronoDuration;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn test_repo() -> SqliteRepository {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap().foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteRepository::new(pool)
    }

    fn sample_entry(entry_id: &str, published_at: DateTime<Utc>) -> NewEntry {
        NewEntry {
            entry_id: entry_id.to_string(),
            title: "Title".to_string(),
            link: Some("https://example.com/post".to_string()),
            author: None,
            published_at,
            updated_at: published_at,
            content: Some("<p>hi</p>".to_string()),
            summary: None,
            content_type: "text/html".to_string(),
        }
    }

    #[tokio::test]
    async fn add_feed_rejects_duplicate_url() {
        let repo = test_repo().await;
        repo.add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();
        let result = repo
            .add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example again".to_string() })
            .await;
        assert!(matches!(result, Err(RepositoryError::DuplicateUrl)));
    }

    #[tokio::test]
    async fn upsert_preserves_first_seen_at_across_updates() {
        let repo = test_repo().await;
        let feed_id = repo
            .add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();

        let published = Utc::now() - ChronoDuration::days(1);
        repo.upsert_entries(feed_id, &[sample_entry("entry-1", published)]).await.unwrap();

        let first_pass = repo.get_recent_entries(30).await.unwrap();
        let first_seen_at = first_pass[0].first_seen_at;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut updated = sample_entry("entry-1", published);
        updated.title = "Updated title".to_string();
        repo.upsert_entries(feed_id, &[updated]).await.unwrap();

        let second_pass = repo.get_recent_entries(30).await.unwrap();
        assert_eq!(second_pass.len(), 1);
        assert_eq!(second_pass[0].title, "Updated title");
        assert_eq!(second_pass[0].first_seen_at, first_seen_at);
    }

    #[tokio::test]
    async fn smart_recency_fallback_returns_history_when_window_is_empty() {
        let repo = test_repo().await;
        let feed_id = repo
            .add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();

        let old = Utc::now() - ChronoDuration::days(30);
        repo.upsert_entries(
            feed_id,
            &[sample_entry("e1", old), sample_entry("e2", old), sample_entry("e3", old)],
        )
        .await
        .unwrap();

        let within_window = repo.get_recent_entries(7).await.unwrap();
        assert_eq!(within_window.len(), 3);

        let recent = Utc::now() - ChronoDuration::hours(1);
        repo.upsert_entries(feed_id, &[sample_entry("e4", recent)]).await.unwrap();

        let within_window = repo.get_recent_entries(7).await.unwrap();
        assert_eq!(within_window.len(), 1);
        assert_eq!(within_window[0].entry_id, "e4");
    }

    #[tokio::test]
    async fn recency_window_excludes_entry_on_cutoff_date_but_past_cutoff_time() {
        let repo = test_repo().await;
        let feed_id = repo
            .add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();

        // Same calendar date as the `-7 days` cutoff but one second older.
        // Stored as `2024-01-02T00:00:00+00:00` (`T` separator, explicit
        // offset) versus SQLite's `datetime('now', ...)` output
        // `2024-01-02 00:00:00` (space separator): on a naive TEXT
        // comparison `T` (0x54) sorts after ` ` (0x20), so this row would be
        // incorrectly judged "within the window" no matter its time of day.
        let just_past_cutoff = Utc::now() - ChronoDuration::days(7) - ChronoDuration::seconds(1);
        repo.upsert_entries(feed_id, &[sample_entry("old", just_past_cutoff)]).await.unwrap();
        // A second, clearly-recent entry keeps the windowed query non-empty
        // so the smart fallback (which ignores the window entirely) doesn't
        // mask the assertion below.
        repo.upsert_entries(feed_id, &[sample_entry("recent", Utc::now())]).await.unwrap();

        let within_window = repo.get_recent_entries_with_options(7, false, SortBy::Published).await.unwrap();
        assert_eq!(within_window.len(), 1);
        assert_eq!(within_window[0].entry_id, "recent");
    }

    #[tokio::test]
    async fn filter_by_first_seen_is_independent_of_sort_column() {
        let repo = test_repo().await;
        let feed_id = repo
            .add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();

        // "backfilled" was published long ago but only just appeared in the
        // feed (first_seen_at is "now", since that's set on insert); "recent"
        // is both recently published and recently first seen.
        let old_publish = Utc::now() - ChronoDuration::days(365);
        repo.upsert_entries(feed_id, &[sample_entry("backfilled", old_publish)]).await.unwrap();
        repo.upsert_entries(feed_id, &[sample_entry("recent", Utc::now())]).await.unwrap();

        // Filtering by published_at (non-empty window, so no smart fallback)
        // excludes the backfilled entry.
        let by_published = repo.get_recent_entries_with_options(7, false, SortBy::Published).await.unwrap();
        assert_eq!(by_published.len(), 1);
        assert_eq!(by_published[0].entry_id, "recent");

        // Filtering by first_seen_at includes it, since both rows were
        // inserted just now regardless of their published_at.
        let by_first_seen = repo.get_recent_entries_with_options(7, true, SortBy::FirstSeen).await.unwrap();
        assert_eq!(by_first_seen.len(), 2);
    }

    #[tokio::test]
    async fn remove_feed_rejects_unknown_id() {
        let repo = test_repo().await;
        let result = repo.remove_feed(999).await;
        assert!(matches!(result, Err(RepositoryError::FeedNotFound)));
    }

    #[tokio::test]
    async fn remove_feed_cascades_to_entries() {
        let repo = test_repo().await;
        let feed_id = repo
            .add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();
        repo.upsert_entries(feed_id, &[sample_entry("e1", Utc::now())]).await.unwrap();

        repo.remove_feed(feed_id).await.unwrap();

        let remaining = repo.get_recent_entries(365).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn update_feed_url_preserves_existing_entries() {
        let repo = test_repo().await;
        let feed_id = repo
            .add_feed(NewFeed { url: "http://old/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();
        repo.upsert_entries(feed_id, &[sample_entry("e1", Utc::now())]).await.unwrap();

        repo.update_feed_url(feed_id, "http://new/feed").await.unwrap();

        assert!(repo.get_feed_by_url("http://old/feed").await.unwrap().is_none());
        let feed = repo.get_feed_by_url("http://new/feed").await.unwrap().unwrap();
        assert_eq!(feed.id, feed_id);
        let entries = repo.get_recent_entries(365).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn fetch_error_increments_count_and_success_clears_it() {
        let repo = test_repo().await;
        let feed_id = repo
            .add_feed(NewFeed { url: "https://example.com/feed".to_string(), title: "Example".to_string() })
            .await
            .unwrap();

        repo.update_feed_error(feed_id, "boom").await.unwrap();
        repo.update_feed_error(feed_id, "boom again").await.unwrap();
        let feed = repo.get_feed_by_url("https://example.com/feed").await.unwrap().unwrap();
        assert_eq!(feed.fetch_error_count, 2);

        repo.clear_feed_error(feed_id).await.unwrap();
        let feed = repo.get_feed_by_url("https://example.com/feed").await.unwrap().unwrap();
        assert_eq!(feed.fetch_error_count, 0);
        assert!(feed.fetch_error.is_none());
    }
}
