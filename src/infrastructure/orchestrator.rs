use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::domain::models::{Feed, FeedCache, NewFeed};
use crate::error::DriftfeedError;
use crate::infrastructure::crawler::Crawl;
use crate::infrastructure::normaliser::Normaliser;
use crate::infrastructure::rate_limiter::RateLimiter;
use crate::infrastructure::repository::FeedRepository;

/// Outcome of refreshing a single feed, reported back for logging/metrics.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub feed_id: i64,
    pub url: String,
    pub result: Result<usize, DriftfeedError>,
}

/// Drives every subscribed feed through fetch → parse → store using a
/// bounded pool of concurrently in-flight feeds.
///
/// The pool is `stream::iter(feeds).map(...).buffer_unordered(pool_size)`
/// rather than spawning `pool_size` long-lived worker tasks pulling from a
/// queue: the two are behaviourally equivalent (at most `pool_size`
/// in-flight at a time, first-come-first-served admission), and
/// `buffer_unordered` gives the same guarantee with no hand-rolled queue.
pub struct Orchestrator {
    repository: Arc<dyn FeedRepository>,
    rate_limiter: Arc<RateLimiter>,
    crawler: Arc<dyn Crawl>,
    normaliser: Arc<Normaliser>,
    pool_size: usize,
    max_retries: u32,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn FeedRepository>,
        rate_limiter: Arc<RateLimiter>,
        crawler: Arc<dyn Crawl>,
        normaliser: Arc<Normaliser>,
        pool_size: usize,
        max_retries: u32,
    ) -> Self {
        Orchestrator { repository, rate_limiter, crawler, normaliser, pool_size, max_retries }
    }

    /// Runs one refresh cycle over every feed currently known to the
    /// Repository. A single `cancel` token is shared across all workers;
    /// cancelling it aborts in-flight HTTP calls and rate-limiter waits,
    /// and no feed's entries are partially written (each feed's writes
    /// happen inside one Repository transaction).
    pub async fn refresh_all(&self, cancel: CancellationToken) -> Result<Vec<RefreshOutcome>, DriftfeedError> {
        let feeds = self.repository.get_feeds(true).await?;
        tracing::info!(count = feeds.len(), "starting refresh cycle");

        let outcomes = stream::iter(feeds)
            .map(|feed| {
                let cancel = cancel.clone();
                async move { self.refresh_one(feed, cancel).await }
            })
            .buffer_unordered(self.pool_size)
            .collect::<Vec<_>>()
            .await;

        Ok(outcomes)
    }

    async fn refresh_one(&self, feed: Feed, cancel: CancellationToken) -> RefreshOutcome {
        let url = feed.url.clone();
        let result = self.refresh_one_inner(&feed, &cancel).await;

        match &result {
            Ok(count) => tracing::info!(feed_id = feed.id, url = %url, entries = count, "feed refreshed"),
            Err(err) => tracing::warn!(feed_id = feed.id, url = %url, error = %err, "feed refresh failed"),
        }

        RefreshOutcome { feed_id: feed.id, url, result }
    }

    async fn refresh_one_inner(&self, feed: &Feed, cancel: &CancellationToken) -> Result<usize, DriftfeedError> {
        self.rate_limiter.wait(&feed.url, cancel).await?;

        let cache = FeedCache::from(feed);
        let response = self
            .crawler
            .fetch_with_retry(&feed.url, &cache, self.max_retries, cancel)
            .await?;

        if response.permanent_redirect {
            self.repository.update_feed_url(feed.id, &response.final_url).await?;
        }

        if response.not_modified {
            self.repository
                .update_feed_cache(feed.id, response.new_cache.etag.as_deref(), response.new_cache.last_modified.as_deref(), response.fetch_time)
                .await?;
            self.repository.clear_feed_error(feed.id).await?;
            return Ok(0);
        }

        let normalise_result = self.normaliser.normalise(&response.body, &response.final_url, response.fetch_time);

        // Cache headers only advance once the body has actually been parsed:
        // if we stored the new etag/last-modified for an unparseable 200 body,
        // the next cycle would send them back, get a 304, and never retry the
        // parse.
        let (metadata, entries) = match normalise_result {
            Ok(parsed) => parsed,
            Err(err) => {
                self.repository.update_feed_error(feed.id, &err.to_string()).await?;
                return Err(DriftfeedError::Normaliser(err));
            }
        };

        self.repository
            .update_feed_cache(feed.id, response.new_cache.etag.as_deref(), response.new_cache.last_modified.as_deref(), response.fetch_time)
            .await?;

        self.repository
            .update_feed(feed.id, &metadata.title, metadata.site_link.as_deref(), metadata.updated_at)
            .await?;

        let count = entries.len();
        self.repository.upsert_entries(feed.id, &entries).await?;
        self.repository.clear_feed_error(feed.id).await?;

        Ok(count)
    }

    /// Adds a new subscription after validating it, per the `AddFeed`
    /// contract: SSRF rejection happens before any row is created and
    /// before any HTTP request is made.
    pub async fn add_feed(&self, url: &str, title: &str) -> Result<i64, DriftfeedError> {
        crate::infrastructure::ssrf::validate_url(url).map_err(crate::error::CrawlerError::InvalidUrl)?;
        let feed_id = self
            .repository
            .add_feed(NewFeed { url: url.to_string(), title: title.to_string() })
            .await?;
        Ok(feed_id)
    }
}
