use thiserror::Error;

/// Errors raised while validating a URL before any network I/O is attempted.
#[derive(Debug, Error)]
pub enum SsrfError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("host resolves to a private or loopback address")]
    PrivateAddress,
    #[error("could not resolve host: {0}")]
    DnsResolutionFailed(String),
}

/// Errors raised while acquiring a rate-limit token for a host.
#[derive(Debug, Error)]
pub enum RateLimiterError {
    #[error("wait for rate limit token was cancelled")]
    Cancelled,
}

/// Errors raised by a single fetch attempt or a retrying fetch.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error(transparent)]
    InvalidUrl(#[from] SsrfError),
    #[error("request timed out")]
    Timeout,
    #[error("response exceeded the maximum allowed size")]
    ResponseTooLarge,
    #[error("redirect cycle or chain too long for {0}")]
    TooManyRedirects(String),
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("terminal HTTP status {code} for {url}")]
    Status { code: u16, url: String },
    #[error("fetch cancelled")]
    Cancelled,
}

impl CrawlerError {
    /// Transient/server errors are worth retrying; terminal client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlerError::Transient(_) | CrawlerError::Timeout => true,
            CrawlerError::Status { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Errors raised while turning raw feed bytes into canonical entries.
#[derive(Debug, Error)]
pub enum NormaliserError {
    #[error("feed could not be parsed: {0}")]
    ParseFailed(String),
}

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("feed with this URL already exists")]
    DuplicateUrl,
    #[error("feed not found")]
    FeedNotFound,
    #[error("stored timestamp could not be parsed for {context}")]
    TimestampParse { context: String },
    #[error("database error while performing {operation}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl RepositoryError {
    pub fn from_sqlx(operation: &'static str, source: sqlx::Error) -> Self {
        RepositoryError::Database { operation, source }
    }
}

/// Errors surfaced by configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("{field} must be in range {min}-{max}, got {actual}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        actual: i64,
    },
    #[error("{field} must not contain '..' path segments")]
    PathTraversal { field: &'static str },
    #[error("{field} must be one of {allowed:?}, got '{actual}'")]
    InvalidChoice {
        field: &'static str,
        allowed: &'static [&'static str],
        actual: String,
    },
}

/// Top-level error the Orchestrator logs and records on a feed row.
///
/// Its `Display` output never forwards an inner error's full `Debug` form,
/// which for `sqlx::Error` can include the on-disk path of the store.
#[derive(Debug, Error)]
pub enum DriftfeedError {
    #[error("crawler error: {0}")]
    Crawler(#[from] CrawlerError),
    #[error("normaliser error: {0}")]
    Normaliser(#[from] NormaliserError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("rate limiter error: {0}")]
    RateLimiter(#[from] RateLimiterError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
