//! Federated single-sign-on: the multi-phase authentication orchestrator,
//! the two second-factor sub-protocols, and SAML form chasing with the
//! silent session refresher.
//!
//! # Architecture
//!
//! - [`Authenticator`] - contract every login backend satisfies (this
//!   crate's HTTP orchestrator; a browser-engine backend would be another)
//! - [`SsoOrchestrator`] - the HTTP phase machine (navigate → credentials →
//!   second factor → SAML hand-back)
//! - [`SessionRefresher`] - replays federation cookies through the SAML
//!   chain without credentials or a second factor
//! - [`DuoChallenge`] - tagged union over the two incompatible challenge
//!   shapes, detected once and dispatched exhaustively

mod duo;
mod orchestrator;
mod saml;

pub use duo::{DuoChallenge, IframeChallenge, PollTiming, UniversalChallenge};
pub use orchestrator::SsoOrchestrator;
pub use saml::SessionRefresher;

use std::fmt;

use async_trait::async_trait;

use crate::auth::CookieSet;
use crate::http::WalkError;

/// Login credentials, supplied per attempt and never persisted.
#[derive(Clone)]
pub struct Credentials {
    /// Account username.
    pub username: String,
    /// Account password (sensitive — never log).
    password: String,
}

impl Credentials {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// The cookie outcome of a successful authentication walk.
#[derive(Debug, Clone, Default)]
pub struct CookieHarvest {
    /// Cookies scoped to the scraped application's domain.
    pub target: CookieSet,
    /// Every cookie observed during the walk, identity provider and
    /// second-factor provider included. Replayable for silent refresh.
    pub federation: CookieSet,
}

/// Authentication and session failures.
///
/// None of these are retried internally; retry policy belongs to callers.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The identity provider rejected the credentials. Terminal.
    #[error("identity provider rejected the credentials")]
    InvalidCredentials,

    /// Neither second-factor challenge variant nor a direct assertion form
    /// appeared after credential submission. Terminal; indicates an
    /// unsupported provider page.
    #[error("no second-factor challenge or assertion form found after login")]
    ChallengeNotFound,

    /// The account holder denied the push. Terminal user decision.
    #[error("second-factor push was denied")]
    ChallengeDenied,

    /// No approval arrived within the polling budget. Terminal.
    #[error("second-factor push timed out after {budget_secs}s")]
    ChallengeTimedOut {
        /// Polling budget that was exhausted, in seconds.
        budget_secs: u64,
    },

    /// The redirect chain ended somewhere other than the target application
    /// or a login page. Terminal; the full chain is logged for diagnosis.
    #[error("login flow completed but no session was established (ended at {final_url})")]
    SessionNotEstablished {
        /// Where the chain ended.
        final_url: String,
    },

    /// The federation session is no longer valid; a full interactive login
    /// is required.
    #[error("session expired")]
    SessionExpired,

    /// Unexpected HTTP failure (network error, bad status, hop-cap
    /// exhaustion).
    #[error(transparent)]
    Transport(#[from] WalkError),

    /// A page or JSON response was missing an expected form, field, or
    /// value.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was malformed or missing.
        reason: String,
    },
}

impl AuthError {
    /// Creates a protocol error with context.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

/// Contract every authentication backend satisfies.
///
/// The HTTP orchestrator implements this; an alternative backend driving a
/// real browser engine would implement the same contract.
///
/// # Object Safety
///
/// Uses `async_trait` so callers can hold `Box<dyn Authenticator>`.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Runs the full login flow and returns the harvested cookie sets.
    ///
    /// Long-running: bounded by the second-factor polling budget. Must not
    /// be invoked concurrently for the same account.
    async fn authenticate(&self, credentials: &Credentials) -> Result<CookieHarvest, AuthError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("gburdell3", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("gburdell3"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_auth_error_messages() {
        assert_eq!(
            AuthError::InvalidCredentials.to_string(),
            "identity provider rejected the credentials"
        );
        let timeout = AuthError::ChallengeTimedOut { budget_secs: 90 };
        assert!(timeout.to_string().contains("90s"));
        let protocol = AuthError::protocol("missing login form");
        assert!(protocol.to_string().contains("missing login form"));
    }
}
