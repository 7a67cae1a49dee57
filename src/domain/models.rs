use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A subscribed feed. `url` is the dedup/lookup key; `etag`/`last_modified`
/// are cache validators stored byte-identical to what the server sent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub site_link: Option<String>,
    pub feed_updated_at: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub next_fetch_at: Option<DateTime<Utc>>,
    pub fetch_error: Option<String>,
    pub fetch_error_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Minimal fields accepted by `AddFeed`.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
    pub title: String,
}

/// A canonical syndication item as stored. `(feed_id, entry_id)` is unique;
/// `first_seen_at` is write-once and must survive re-insertion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub entry_id: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub content_type: String,
    pub first_seen_at: DateTime<Utc>,
}

/// The Normaliser's output shape for one item: everything needed to upsert,
/// minus the fields the Repository assigns (`id`, `first_seen_at`).
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub entry_id: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub content_type: String,
}

/// Canonical metadata the Normaliser extracts from a feed's channel-level block.
#[derive(Debug, Clone)]
pub struct FeedMetadata {
    pub title: String,
    pub site_link: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Transient per-fetch tuple built from `Feed` before each crawl.
#[derive(Debug, Clone, Default)]
pub struct FeedCache {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
}

impl From<&Feed> for FeedCache {
    fn from(feed: &Feed) -> Self {
        FeedCache {
            url: feed.url.clone(),
            etag: feed.etag.clone(),
            last_modified: feed.last_modified.clone(),
            last_fetched: feed.last_fetched_at,
        }
    }
}

/// Cache validators observed on the most recent response, carried forward
/// verbatim regardless of whether the body changed.
#[derive(Debug, Clone, Default)]
pub struct NewCache {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Result of one Crawler fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub body: Vec<u8>,
    pub status: u16,
    pub fetch_time: DateTime<Utc>,
    pub not_modified: bool,
    pub permanent_redirect: bool,
    pub final_url: String,
    pub new_cache: NewCache,
}

/// Sort policy for `GetRecentEntriesWithOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortBy {
    Published,
    FirstSeen,
}

impl SortBy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "published" => Some(SortBy::Published),
            "first_seen" => Some(SortBy::FirstSeen),
            _ => None,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            SortBy::Published => "published_at",
            SortBy::FirstSeen => "first_seen_at",
        }
    }
}
