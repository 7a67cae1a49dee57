use ammonia::Builder;
use chrono::{DateTime, Utc};
use feed_rs::model::{Entry as RawEntry, Feed as RawFeed};
use sha2::{Digest, Sha256};
use url::Url;

use crate::domain::models::{FeedMetadata, NewEntry};
use crate::error::NormaliserError;

/// Parses raw feed bytes and yields canonical metadata plus entries.
///
/// Detection of RSS 1.0/2.0, Atom 1.0, or JSON Feed 1.0/1.1 is content-based
/// (`feed_rs` sniffs the body; no format hint is passed). Unknown elements
/// are ignored by the underlying parser.
pub struct Normaliser {
    sanitiser: Sanitiser,
}

impl Default for Normaliser {
    fn default() -> Self {
        Normaliser { sanitiser: Sanitiser::new() }
    }
}

impl Normaliser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `feed_url` is the base for resolving relative entry links; `fetch_time`
    /// is the fallback `published_at` when nothing better is available.
    pub fn normalise(
        &self,
        body: &[u8],
        feed_url: &str,
        fetch_time: DateTime<Utc>,
    ) -> Result<(FeedMetadata, Vec<NewEntry>), NormaliserError> {
        let raw = feed_rs::parser::parse(body).map_err(|e| NormaliserError::ParseFailed(e.to_string()))?;

        let metadata = self.extract_metadata(&raw);
        let base = Url::parse(feed_url).ok();

        let entries = raw
            .entries
            .iter()
            .map(|entry| self.normalise_entry(entry, &raw, feed_url, base.as_ref(), fetch_time))
            .collect();

        Ok((metadata, entries))
    }

    fn extract_metadata(&self, raw: &RawFeed) -> FeedMetadata {
        let title = raw
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Untitled feed".to_string());

        let site_link = raw.links.first().map(|l| l.href.clone());

        FeedMetadata { title, site_link, updated_at: raw.updated }
    }

    fn normalise_entry(
        &self,
        entry: &RawEntry,
        feed: &RawFeed,
        feed_url: &str,
        base: Option<&Url>,
        fetch_time: DateTime<Utc>,
    ) -> NewEntry {
        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .unwrap_or_default();

        let link = entry
            .links
            .first()
            .map(|l| resolve_link(&l.href, base));

        let published_at = entry
            .published
            .or(entry.updated)
            .or(feed.updated)
            .unwrap_or(fetch_time);

        let updated_at = entry.updated.unwrap_or(published_at);

        let author = entry
            .authors
            .first()
            .map(|a| a.name.clone())
            .or_else(|| feed.authors.first().map(|a| a.name.clone()))
            .filter(|a| !a.trim().is_empty());

        let raw_content = entry.content.as_ref().and_then(|c| c.body.clone());
        let raw_summary = entry.summary.as_ref().map(|s| s.content.clone());

        let content = raw_content.as_deref().map(|c| self.sanitiser.clean(c));
        let summary = raw_summary.as_deref().map(|s| self.sanitiser.clean(s));

        let entry_id = derive_entry_id(&entry.id, feed_url, link.as_deref(), &title, published_at);

        NewEntry {
            entry_id,
            title,
            link,
            author,
            published_at,
            updated_at,
            content,
            summary,
            content_type: "text/html".to_string(),
        }
    }
}

fn resolve_link(href: &str, base: Option<&Url>) -> String {
    match base {
        Some(base) => base.join(href).map(|u| u.to_string()).unwrap_or_else(|_| href.to_string()),
        None => href.to_string(),
    }
}

/// Uses the feed-provided GUID/id when present; otherwise derives a stable
/// hash over `(feed_url, link, title, published)` so the same logical entry
/// produces the same id across runs. Fields are joined with a control byte
/// that cannot appear in any of them, so two different splits of the same
/// concatenated bytes can never collide.
fn derive_entry_id(
    raw_id: &str,
    feed_url: &str,
    link: Option<&str>,
    title: &str,
    published_at: DateTime<Utc>,
) -> String {
    if !raw_id.trim().is_empty() {
        return raw_id.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(feed_url.as_bytes());
    hasher.update([0x01]);
    hasher.update(link.unwrap_or("").as_bytes());
    hasher.update([0x01]);
    hasher.update(title.as_bytes());
    hasher.update([0x01]);
    hasher.update(published_at.to_rfc3339().as_bytes());

    format!("{:x}", hasher.finalize())
}

/// Wraps `ammonia` configured to the canonicalisation policy: only
/// `http`/`https`/`mailto` schemes survive on `href`/`src`; script-bearing
/// and structural-injection tags are removed along with their contents,
/// not just their attributes.
struct Sanitiser {
    builder: Builder<'static>,
}

impl Sanitiser {
    fn new() -> Self {
        let mut builder = Builder::default();
        builder
            .url_schemes(["http", "https", "mailto"].into_iter().collect())
            .clean_content_tags(["script", "object", "embed", "iframe", "base", "form"].into_iter().collect())
            .link_rel(Some("noopener noreferrer"));
        Sanitiser { builder }
    }

    fn clean(&self, html: &str) -> String {
        self.builder.clean(html).to_string()
    }
}
