use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION, USER_AGENT};
use reqwest::{Client, StatusCode};

use crate::domain::models::{FeedCache, FetchResponse, NewCache};
use crate::error::CrawlerError;
use crate::infrastructure::ssrf;

const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
const MAX_REDIRECTS: u8 = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The fetch capability seam: lets the Orchestrator depend on a trait
/// rather than a concrete `Crawler`, so tests can substitute fakes.
#[async_trait]
pub trait Crawl: Send + Sync {
    async fn fetch_with_retry(
        &self,
        url: &str,
        cache: &FeedCache,
        max_retries: u32,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<FetchResponse, CrawlerError>;
}

/// Performs conditional-GET HTTP fetches with SSRF checks, redirect
/// classification, gzip decompression, and a hard response-size cap.
///
/// Redirects are followed manually (the underlying client is built with
/// `redirect::Policy::none()`) because 301/308 must be distinguished from
/// 302/303/307: the former rewrites the feed's persisted URL, the latter
/// does not, and a client-level auto-follow loses that distinction.
pub struct Crawler {
    client: Client,
    user_agent: String,
    allow_loopback: bool,
}

impl Crawler {
    pub fn new(user_agent: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .gzip(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is valid");

        Crawler { client, user_agent, allow_loopback: false }
    }

    /// Test-only constructor that permits fetching loopback addresses, so
    /// tests can point the crawler at a `wiremock::MockServer`. Must never
    /// be reachable from a production code path.
    pub fn new_test(user_agent: String, timeout: Duration) -> Self {
        let mut crawler = Self::new(user_agent, timeout);
        crawler.allow_loopback = true;
        crawler
    }

    fn validate(&self, url: &str) -> Result<(), CrawlerError> {
        if self.allow_loopback {
            ssrf::validate_url_allow_loopback(url).map_err(CrawlerError::InvalidUrl)
        } else {
            ssrf::validate_url(url).map_err(CrawlerError::InvalidUrl)
        }
    }

    /// One fetch attempt: no retrying, no rate limiting (those are the
    /// caller's responsibility).
    pub async fn fetch(&self, url: &str, cache: &FeedCache) -> Result<FetchResponse, CrawlerError> {
        self.fetch_inner(url, cache, 0)
    .await
    }

    fn fetch_inner<'a>(
        &'a self,
        url: &'a str,
        cache: &'a FeedCache,
        redirect_count: u8,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<FetchResponse, CrawlerError>> + Send + 'a>> {
        Box::pin(async move {
            if redirect_count > MAX_REDIRECTS {
                return Err(CrawlerError::TooManyRedirects(url.to_string()));
            }

            self.validate(url)?;

            let mut headers = HeaderMap::new();
            headers.insert(
                USER_AGENT,
                HeaderValue::from_str(&self.user_agent).unwrap_or_else(|_| HeaderValue::from_static("driftfeed")),
            );
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
            if let Some(etag) = cache.etag.as_deref().filter(|e| !e.is_empty()) {
                if let Ok(value) = HeaderValue::from_str(etag) {
                    headers.insert(IF_NONE_MATCH, value);
                }
            }
            if let Some(last_modified) = cache.last_modified.as_deref().filter(|v| !v.is_empty()) {
                if let Ok(value) = HeaderValue::from_str(last_modified) {
                    headers.insert(IF_MODIFIED_SINCE, value);
                }
            }

            let response = self
                .client
                .get(url)
                .headers(headers)
                .send()
                .await
                .map_err(classify_reqwest_error)?;

            let status = response.status();
            let new_cache = extract_cache_headers(response.headers());

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| CrawlerError::Transient("redirect with no Location header".to_string()))?;

                let resolved = reqwest::Url::parse(url)
                    .and_then(|base| base.join(location))
                    .map_err(|e| CrawlerError::Transient(format!("invalid redirect location: {e}")))?;
                let resolved = resolved.to_string();

                return match status {
                    StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT => {
                        let mut result = self.fetch_inner(&resolved, cache, redirect_count + 1).await?;
                        result.permanent_redirect = true;
                        result.final_url = resolved;
                        Ok(result)
                    }
                    _ => self.fetch_inner(&resolved, cache, redirect_count + 1).await,
                };
            }

            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchResponse {
                    body: Vec::new(),
                    status: status.as_u16(),
                    fetch_time: Utc::now(),
                    not_modified: true,
                    permanent_redirect: false,
                    final_url: url.to_string(),
                    new_cache: NewCache {
                        etag: new_cache.etag.or_else(|| cache.etag.clone()),
                        last_modified: new_cache.last_modified.or_else(|| cache.last_modified.clone()),
                    },
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(CrawlerError::Transient(format!("status {}", status.as_u16())));
            }

            if !status.is_success() {
                return Err(CrawlerError::Status { code: status.as_u16(), url: url.to_string() });
            }

            if let Some(len) = response.content_length() {
                if len > MAX_BODY_BYTES {
                    return Err(CrawlerError::ResponseTooLarge);
                }
            }

            let body = read_capped(response).await?;

            Ok(FetchResponse {
                body,
                status: status.as_u16(),
                fetch_time: Utc::now(),
                not_modified: false,
                permanent_redirect: false,
                final_url: url.to_string(),
                new_cache,
            })
        })
    }
}

#[async_trait]
impl Crawl for Crawler {
    async fn fetch_with_retry(
        &self,
        url: &str,
        cache: &FeedCache,
        max_retries: u32,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<FetchResponse, CrawlerError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(CrawlerError::Cancelled);
            }

            let outcome = tokio::select! {
                result = self.fetch(url, cache) => result,
                _ = cancel.cancelled() => return Err(CrawlerError::Cancelled),
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    let delay = backoff_delay(attempt);
                    tracing::debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CrawlerError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1).saturating_mul(1u32 << attempt.min(6));
    apply_jitter(base).min(MAX_BACKOFF)
}

fn apply_jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.8..1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

fn classify_reqwest_error(err: reqwest::Error) -> CrawlerError {
    if err.is_timeout() {
        CrawlerError::Timeout
    } else {
        CrawlerError::Transient(err.to_string())
    }
}

/// Extracts cache validators exactly as received: no trimming, no
/// re-quoting. `ETag` commonly arrives pre-quoted (`"abc"`); that string is
/// stored verbatim so the next request's `If-None-Match` matches byte for
/// byte.
fn extract_cache_headers(headers: &HeaderMap) -> NewCache {
    NewCache {
        etag: headers.get(ETAG).and_then(|v| v.to_str().ok()).map(|s| s.to_string()),
        last_modified: headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    }
}

async fn read_capped(response: reqwest::Response) -> Result<Vec<u8>, CrawlerError> {
    use futures::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_reqwest_error)?;
        if buf.len() as u64 + chunk.len() as u64 > MAX_BODY_BYTES {
            return Err(CrawlerError::ResponseTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn crawler() -> Crawler {
        Crawler::new_test("driftfeed/test (+https://example.com)".to_string(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn conditional_get_sends_stored_etag_and_receives_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .and(header("If-None-Match", "\"abc\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let crawler = crawler();
        let cache = FeedCache {
            url: format!("{}/feed.xml", server.uri()),
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
            last_fetched: None,
        };

        let response = crawler.fetch(&cache.url, &cache).await.unwrap();
        assert!(response.not_modified);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn permanent_redirect_is_classified_and_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss></rss>"))
            .mount(&server)
            .await;

        let crawler = crawler();
        let url = format!("{}/old", server.uri());
        let cache = FeedCache { url: url.clone(), ..Default::default() };

        let response = crawler.fetch(&url, &cache).await.unwrap();
        assert!(response.permanent_redirect);
        assert!(response.final_url.ends_with("/new"));
    }

    #[tokio::test]
    async fn temporary_redirect_does_not_rewrite_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/b"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let crawler = crawler();
        let url = format!("{}/a", server.uri());
        let cache = FeedCache { url: url.clone(), ..Default::default() };

        let response = crawler.fetch(&url, &cache).await.unwrap();
        assert!(!response.permanent_redirect);
    }

    #[tokio::test]
    async fn server_error_is_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let crawler = crawler();
        let url = format!("{}/flaky", server.uri());
        let cache = FeedCache { url: url.clone(), ..Default::default() };
        let cancel = tokio_util::sync::CancellationToken::new();

        let response = crawler.fetch_with_retry(&url, &cache, 3, &cancel).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn terminal_4xx_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let crawler = crawler();
        let url = format!("{}/missing", server.uri());
        let cache = FeedCache { url: url.clone(), ..Default::default() };
        let cancel = tokio_util::sync::CancellationToken::new();

        let result = crawler.fetch_with_retry(&url, &cache, 3, &cancel).await;
        assert!(matches!(result, Err(CrawlerError::Status { code: 404, .. })));
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let server = MockServer::start().await;
        let big_body = vec![b'x'; (MAX_BODY_BYTES + 1) as usize];
        Mock::given(method("GET"))
            .and(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(big_body))
            .mount(&server)
            .await;

        let crawler = crawler();
        let url = format!("{}/huge", server.uri());
        let cache = FeedCache { url: url.clone(), ..Default::default() };

        let result = crawler.fetch(&url, &cache).await;
        assert!(matches!(result, Err(CrawlerError::ResponseTooLarge)));
    }

    #[tokio::test]
    async fn production_constructor_rejects_loopback_target() {
        let crawler = Crawler::new("driftfeed/test (+https://example.com)".to_string(), Duration::from_secs(5));
        let cache = FeedCache { url: "http://127.0.0.1/feed".to_string(), ..Default::default() };
        let result = crawler.fetch("http://127.0.0.1/feed", &cache).await;
        assert!(matches!(result, Err(CrawlerError::InvalidUrl(_))));
    }
}
