//! Session cookie records and the two named cookie sets.
//!
//! A [`CookieSet`] is an ordered collection of cookies tagged with the domain
//! and path they were issued for. Two instances are persisted between runs:
//! the target set (only cookies scoped to the scraped application's domain)
//! and the federation set (every cookie observed anywhere during the
//! authentication walk). The federation set alone can be replayed to attempt
//! a silent session refresh without re-prompting the second factor.

use std::fmt;
use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, SET_COOKIE};
use tracing::{debug, warn};
use url::Url;

/// A single cookie with its issuing scope.
///
/// The value field is redacted in Debug output to prevent accidental logging
/// of session secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct CookieRecord {
    /// Cookie name. May contain characters a standard jar rejects
    /// (the second-factor provider issues names like `sid|{uuid}`).
    pub name: String,
    /// Domain the cookie was issued for (no leading dot).
    pub domain: String,
    /// Path scope, `/` when unspecified.
    pub path: String,
    /// Cookie value (sensitive — never log).
    value: String,
}

impl CookieRecord {
    /// Creates a new cookie record.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: path.into(),
        }
    }

    /// Returns the cookie value.
    ///
    /// Cookie values are sensitive — avoid logging the return value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for CookieRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieRecord")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Ordered name → cookie mapping for one scope of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieSet {
    records: Vec<CookieRecord>,
}

impl CookieSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cookies in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the set holds no cookies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates cookies in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &CookieRecord> {
        self.records.iter()
    }

    /// Looks up a cookie by name (first match in insertion order).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CookieRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// Inserts a cookie, replacing any existing entry with the same name and
    /// domain in place (preserving its position).
    pub fn insert(&mut self, record: CookieRecord) {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.name == record.name && r.domain == record.domain)
        {
            *existing = record;
        } else {
            self.records.push(record);
        }
    }

    /// Records every Set-Cookie header of a response, tagging entries that
    /// carry no Domain attribute with the responding host.
    pub fn record_response(&mut self, url: &Url, headers: &HeaderMap) {
        let fallback_domain = url.host_str().unwrap_or_default();

        for header in headers.get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else {
                warn!(url = %url, "skipping non-UTF8 Set-Cookie header");
                continue;
            };
            if let Some(record) = parse_set_cookie(raw, fallback_domain) {
                debug!(name = %record.name, domain = %record.domain, "recorded cookie");
                self.insert(record);
            }
        }
    }

    /// Returns the subset of cookies scoped to `host` (exact match or a
    /// parent domain of it), preserving order.
    #[must_use]
    pub fn filter_domain(&self, host: &str) -> CookieSet {
        let records = self
            .records
            .iter()
            .filter(|record| domain_matches(&record.domain, host))
            .cloned()
            .collect();
        CookieSet { records }
    }

    /// Builds a raw `Cookie` header value from the set.
    ///
    /// This is the escape hatch for cookies whose names a standard jar cannot
    /// round-trip; it is also how the scrape engine presents its persisted
    /// target cookies.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.records
            .iter()
            .map(|record| format!("{}={}", record.name, record.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Loads the set into a `reqwest` cookie jar for automatic attachment.
    ///
    /// Cookies with names the jar rejects are skipped (they are still carried
    /// by [`CookieSet::cookie_header`] where needed).
    #[must_use]
    pub fn to_jar(&self) -> Arc<Jar> {
        let jar = Arc::new(Jar::default());
        for record in &self.records {
            let set_cookie = format!(
                "{}={}; Domain={}; Path={}",
                record.name, record.value, record.domain, record.path
            );
            let origin = format!("https://{}{}", record.domain, record.path);
            if let Ok(origin_url) = origin.parse::<Url>() {
                jar.add_cookie_str(&set_cookie, &origin_url);
            } else {
                warn!(
                    domain = %record.domain,
                    name = %record.name,
                    "skipping cookie with unparseable domain"
                );
            }
        }
        jar
    }
}

impl FromIterator<CookieRecord> for CookieSet {
    fn from_iter<I: IntoIterator<Item = CookieRecord>>(iter: I) -> Self {
        let mut set = CookieSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

/// True when a cookie issued for `cookie_domain` applies to `host`.
pub(crate) fn domain_matches(cookie_domain: &str, host: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.');
    if domain.is_empty() {
        return false;
    }
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Parses one Set-Cookie header value into a record.
///
/// Only the name/value pair and the Domain and Path attributes are kept;
/// expiry is left to the issuing server to enforce.
fn parse_set_cookie(raw: &str, fallback_domain: &str) -> Option<CookieRecord> {
    let mut segments = raw.split(';');

    let (name, value) = segments.next()?.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut domain = fallback_domain.to_string();
    let mut path = "/".to_string();

    for segment in segments {
        let segment = segment.trim();
        let (key, attr_value) = match segment.split_once('=') {
            Some((key, attr_value)) => (key.trim(), attr_value.trim()),
            None => (segment, ""),
        };
        if key.eq_ignore_ascii_case("domain") && !attr_value.is_empty() {
            domain = attr_value.trim_start_matches('.').to_string();
        } else if key.eq_ignore_ascii_case("path") && !attr_value.is_empty() {
            path = attr_value.to_string();
        }
    }

    Some(CookieRecord::new(name, value, domain, path))
}
