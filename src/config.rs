use std::env;

use crate::domain::models::SortBy;
use crate::error::ConfigError;

/// Validated runtime configuration, loaded once at startup.
///
/// Every bound named in the component design (concurrency, retries, rate
/// limits, recency window) is checked here rather than deferred to first
/// use, so a misconfigured deployment fails at startup instead of behaving
/// oddly hours into a refresh cycle.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub site_title: String,
    pub contact_url: String,
    pub concurrency: usize,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    pub recency_days: i64,
    pub sort_by: SortBy,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bounded(
    field: &'static str,
    raw: String,
    min: i64,
    max: i64,
) -> Result<i64, ConfigError> {
    let value: i64 = raw
        .parse()
        .map_err(|_| ConfigError::OutOfRange { field, min, max, actual: i64::MIN })?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { field, min, max, actual: value });
    }
    Ok(value)
}

impl Config {
    /// Load configuration from the environment, applying `.env` first.
    ///
    /// Defaults to in-production-safe values; any present-but-invalid value
    /// is a hard error rather than a silent clamp.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url = env_or("DRIFTFEED_DATABASE_URL", "sqlite://driftfeed.db");
        if database_url.contains("..") {
            return Err(ConfigError::PathTraversal { field: "DRIFTFEED_DATABASE_URL" });
        }

        let site_title = env_or("DRIFTFEED_SITE_TITLE", "driftfeed");

        let contact_url = env::var("DRIFTFEED_CONTACT_URL")
            .map_err(|_| ConfigError::Missing("DRIFTFEED_CONTACT_URL"))?;
        if url::Url::parse(&contact_url).is_err() {
            return Err(ConfigError::OutOfRange {
                field: "DRIFTFEED_CONTACT_URL",
                min: 0,
                max: 0,
                actual: -1,
            });
        }

        let concurrency =
            parse_bounded("DRIFTFEED_CONCURRENCY", env_or("DRIFTFEED_CONCURRENCY", "8"), 1, 50)?
                as usize;

        let max_retries = parse_bounded(
            "DRIFTFEED_MAX_RETRIES",
            env_or("DRIFTFEED_MAX_RETRIES", "3"),
            0,
            10,
        )? as u32;

        let request_timeout_secs = parse_bounded(
            "DRIFTFEED_REQUEST_TIMEOUT_SECS",
            env_or("DRIFTFEED_REQUEST_TIMEOUT_SECS", "30"),
            1,
            120,
        )? as u64;

        let rate_limit_rpm = parse_bounded(
            "DRIFTFEED_RATE_LIMIT_RPM",
            env_or("DRIFTFEED_RATE_LIMIT_RPM", "60"),
            1,
            600,
        )? as u32;

        let rate_limit_burst = parse_bounded(
            "DRIFTFEED_RATE_LIMIT_BURST",
            env_or("DRIFTFEED_RATE_LIMIT_BURST", "5"),
            1,
            50,
        )? as u32;

        let recency_days = parse_bounded(
            "DRIFTFEED_RECENCY_DAYS",
            env_or("DRIFTFEED_RECENCY_DAYS", "7"),
            1,
            i64::MAX,
        )?;

        let sort_by_raw = env_or("DRIFTFEED_SORT_BY", "published");
        let sort_by = SortBy::parse(&sort_by_raw).ok_or_else(|| ConfigError::InvalidChoice {
            field: "DRIFTFEED_SORT_BY",
            allowed: &["published", "first_seen"],
            actual: sort_by_raw.clone(),
        })?;

        Ok(Config {
            database_url,
            site_title,
            contact_url,
            concurrency,
            max_retries,
            request_timeout_secs,
            rate_limit_rpm,
            rate_limit_burst,
            recency_days,
            sort_by,
        })
    }

    /// `<product>/<version> (+<contact URL>)`, used verbatim as the crawler's User-Agent.
    pub fn user_agent(&self) -> String {
        crate::user_agent(&self.contact_url)
    }
}
