//! The stateful scrape engine for the server-rendered application:
//! balance-page parsing, the paginated transaction search driven by partial
//! postbacks, and the length-prefixed delta response codec.
//!
//! # Architecture
//!
//! - [`ScrapeEngine`] - fetches pages, drives postbacks, recovers once from
//!   an expired session via the silent refresher
//! - [`delta`] - codec for the `length|type|id|content|` multi-part format
//! - [`dates`] - locale date input → wire encoding and client-state blob
//! - [`SessionContext`] - the exclusively-owned cookie state threaded
//!   through every operation; persistence is the caller's side effect

pub mod dates;
pub mod delta;
mod engine;

pub use engine::{ScrapeEngine, SessionContext};

use serde::{Deserialize, Serialize};

/// One account row from the balance page.
///
/// The balance field carries a status string instead (e.g. "inactive") when
/// the account has no numeric balance. All values are plain text as
/// rendered; downstream consumers own numeric parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Account display name.
    pub name: String,
    /// Balance or status text as rendered.
    pub balance: String,
}

/// One transaction row, all fields as rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction date text (locale format).
    pub date: String,
    /// Account the transaction posted against.
    pub account: String,
    /// Merchant/terminal location.
    pub location: String,
    /// Transaction type text.
    #[serde(rename = "type")]
    pub kind: String,
    /// Amount text as rendered.
    pub amount: String,
}

/// Errors from scrape operations.
///
/// `SessionExpired` is the only kind the engine recovers from automatically
/// (one silent-refresh attempt); everything else propagates unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// The application session is gone and a refresh did not revive it.
    #[error("session expired")]
    SessionExpired,

    /// Network-level failure.
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with an unexpected status.
    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus {
        /// The URL that answered.
        url: String,
        /// The status code.
        status: u16,
    },

    /// The server redirected somewhere that is not a login page.
    #[error("unexpected redirect from {url} to {location}")]
    UnexpectedRedirect {
        /// The URL that redirected.
        url: String,
        /// Where it pointed.
        location: String,
    },

    /// A page, delta response, or date input was malformed.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was malformed or missing.
        reason: String,
    },
}

impl ScrapeError {
    /// Creates a network error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an unexpected-status error.
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::UnexpectedStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a protocol error with context.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_record_serializes_type_field() {
        let record = TransactionRecord {
            date: "2/1/2026 12:31 PM".to_string(),
            account: "Dining Dollars".to_string(),
            location: "West Village".to_string(),
            kind: "Debit".to_string(),
            amount: "-$8.75".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "Debit");
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn test_scrape_error_messages() {
        assert_eq!(ScrapeError::SessionExpired.to_string(), "session expired");
        let status = ScrapeError::status("https://x/y", 503);
        assert!(status.to_string().contains("503"));
    }
}
