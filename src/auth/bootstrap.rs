//! Bootstrap cookie import for first runs with no persisted session.
//!
//! Accepts a base64-encoded JSON blob in one of two shapes:
//! - a flat `{name: value}` object (assumed to be target-application
//!   cookies),
//! - a browser-exported session-state document
//!   `{"cookies": [{name, value, domain, path}, ...]}`, from which only
//!   entries whose domain matches the target application are retained.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{CookieRecord, CookieSet};

/// Errors that can occur while importing a bootstrap cookie blob.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Input was empty.
    #[error("bootstrap cookie input is empty")]
    EmptyInput,
    /// Base64 decoding failed.
    #[error("invalid base64 in bootstrap cookies: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Decoded bytes were not valid UTF-8.
    #[error("bootstrap cookies are not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    /// JSON parsing failed.
    #[error("invalid bootstrap cookie JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// No cookies remained after domain filtering.
    #[error("no cookies for {target_host} found in bootstrap input")]
    NoMatchingCookies {
        /// The host the import filtered for.
        target_host: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BootstrapPayload {
    SessionState { cookies: Vec<SessionStateCookie> },
    Flat(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Deserialize)]
struct SessionStateCookie {
    name: String,
    value: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    path: Option<String>,
}

/// Decodes a base64 bootstrap blob into a target cookie set.
///
/// Flat-map entries are all kept and tagged with `target_host`; session-state
/// entries are kept only when their domain matches the target application.
///
/// # Errors
///
/// Returns [`BootstrapError`] when decoding or parsing fails, or when no
/// usable cookie survives domain filtering.
#[instrument(level = "debug", skip(blob))]
pub fn import_bootstrap_cookies(blob: &str, target_host: &str) -> Result<CookieSet, BootstrapError> {
    let trimmed = blob.trim();
    if trimmed.is_empty() {
        return Err(BootstrapError::EmptyInput);
    }

    let decoded = BASE64.decode(trimmed)?;
    let text = String::from_utf8(decoded)?;
    let payload: BootstrapPayload = serde_json::from_str(&text)?;

    let mut set = CookieSet::new();
    match payload {
        BootstrapPayload::SessionState { cookies } => {
            debug!(total = cookies.len(), "session-state bootstrap document");
            for cookie in cookies {
                if super::cookies::domain_matches(&cookie.domain, target_host) {
                    set.insert(CookieRecord::new(
                        cookie.name,
                        cookie.value,
                        target_host,
                        cookie.path.unwrap_or_else(|| "/".to_string()),
                    ));
                }
            }
        }
        BootstrapPayload::Flat(entries) => {
            debug!(total = entries.len(), "flat bootstrap map");
            for (name, value) in entries {
                if let Some(value) = value.as_str() {
                    set.insert(CookieRecord::new(name, value, target_host, "/"));
                }
            }
        }
    }

    if set.is_empty() {
        return Err(BootstrapError::NoMatchingCookies {
            target_host: target_host.to_string(),
        });
    }

    debug!(kept = set.len(), "bootstrap cookies imported");
    Ok(set)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encode(json: &str) -> String {
        BASE64.encode(json.as_bytes())
    }

    const HOST: &str = "eacct.example.com";

    #[test]
    fn test_import_flat_map_keeps_all_entries() {
        let blob = encode(r#"{"ASP.NET_SessionId": "abc", ".AUTHCOOKIE": "xyz"}"#);
        let set = import_bootstrap_cookies(&blob, HOST).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("ASP.NET_SessionId").unwrap().value(), "abc");
        assert_eq!(set.get("ASP.NET_SessionId").unwrap().domain, HOST);
    }

    #[test]
    fn test_import_session_state_filters_by_domain() {
        let blob = encode(
            r#"{"cookies": [
                {"name": "keep", "value": "1", "domain": "eacct.example.com", "path": "/"},
                {"name": "keep2", "value": "2", "domain": ".example.com", "path": "/"},
                {"name": "drop", "value": "3", "domain": "sso.other.edu", "path": "/"}
            ]}"#,
        );
        let set = import_bootstrap_cookies(&blob, HOST).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get("keep").is_some());
        assert!(set.get("keep2").is_some());
        assert!(set.get("drop").is_none());
    }

    #[test]
    fn test_import_session_state_all_filtered_is_error() {
        let blob = encode(
            r#"{"cookies": [
                {"name": "drop", "value": "3", "domain": "sso.other.edu", "path": "/"}
            ]}"#,
        );
        let result = import_bootstrap_cookies(&blob, HOST);
        assert!(matches!(
            result,
            Err(BootstrapError::NoMatchingCookies { .. })
        ));
    }

    #[test]
    fn test_import_empty_input_fails() {
        assert!(matches!(
            import_bootstrap_cookies("   ", HOST),
            Err(BootstrapError::EmptyInput)
        ));
    }

    #[test]
    fn test_import_invalid_base64_fails() {
        assert!(matches!(
            import_bootstrap_cookies("!!!not-base64!!!", HOST),
            Err(BootstrapError::Base64(_))
        ));
    }

    #[test]
    fn test_import_invalid_json_fails() {
        let blob = BASE64.encode(b"not json at all");
        assert!(matches!(
            import_bootstrap_cookies(&blob, HOST),
            Err(BootstrapError::Json(_))
        ));
    }

    #[test]
    fn test_import_flat_map_skips_non_string_values() {
        let blob = encode(r#"{"ok": "1", "bad": 42}"#);
        let set = import_bootstrap_cookies(&blob, HOST).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get("bad").is_none());
    }
}
