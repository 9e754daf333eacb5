//! Caller-facing facade over login, refresh, and scrape operations.
//!
//! Owns the persistence side effects: cookie sets are read from the vault at
//! the start of every operation and written back after every successful
//! login, refresh, or cookie-bearing scrape. Every method returns a
//! structured result; errors map to a wire shape distinguishing
//! `session_expired` (prompt for a fresh interactive login) from everything
//! else.

use chrono::Local;
use serde::Serialize;
use tracing::{info, instrument, warn};
use url::Url;

use crate::auth::{BootstrapError, CookieVault, StoreError, VaultSlot, import_bootstrap_cookies};
use crate::scrape::{
    BalanceRecord, ScrapeEngine, ScrapeError, SessionContext, TransactionRecord,
};
use crate::sso::{AuthError, Authenticator, Credentials, SsoOrchestrator};

/// The page the login flow lands on; also the keep-alive fetch target.
const LOGIN_LANDING_PAGE: &str = "AccountSummary.aspx";

/// Result of a balance fetch.
#[derive(Debug, Serialize)]
pub struct BalanceReport {
    /// Account rows as rendered.
    pub accounts: Vec<BalanceRecord>,
    /// When the fetch completed (RFC 3339, local offset).
    pub timestamp: String,
    /// Always `success` on the Ok path.
    pub status: String,
}

/// Result of a transaction fetch.
#[derive(Debug, Serialize)]
pub struct TransactionReport {
    /// Transaction rows as rendered.
    pub transactions: Vec<TransactionRecord>,
    /// Row count.
    pub count: usize,
    /// Requested begin date (empty when the default window applied).
    pub begin_date: String,
    /// Requested end date (empty when the default window applied).
    pub end_date: String,
    /// When the fetch completed (RFC 3339, local offset).
    pub timestamp: String,
    /// Always `success` on the Ok path.
    pub status: String,
}

/// Result of an interactive login.
#[derive(Debug, Serialize)]
pub struct LoginReport {
    /// Always `success` on the Ok path.
    pub status: String,
    /// Number of target-application cookies harvested.
    pub cookies_count: usize,
}

/// Failures surfaced by the facade.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The session is gone; a fresh interactive login is required.
    #[error("session expired")]
    SessionExpired,

    /// Authentication failed (taxonomy in [`AuthError`]).
    #[error(transparent)]
    Auth(AuthError),

    /// A scrape operation failed for a non-expiry reason.
    #[error(transparent)]
    Scrape(ScrapeError),

    /// Cookie persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Bootstrap cookie import failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// The facade was misconfigured.
    #[error("configuration error: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },
}

impl From<ScrapeError> for ServiceError {
    fn from(error: ScrapeError) -> Self {
        match error {
            ScrapeError::SessionExpired => Self::SessionExpired,
            other => Self::Scrape(other),
        }
    }
}

impl From<AuthError> for ServiceError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::SessionExpired => Self::SessionExpired,
            other => Self::Auth(other),
        }
    }
}

impl ServiceError {
    /// True when the caller should prompt for a fresh interactive login.
    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// The wire error shape: `{"error": "session_expired"}` for expiry,
    /// `{"error": <message>}` otherwise.
    #[must_use]
    pub fn wire_body(&self) -> serde_json::Value {
        if self.is_session_expired() {
            serde_json::json!({ "error": "session_expired" })
        } else {
            serde_json::json!({ "error": self.to_string() })
        }
    }
}

/// Facade binding the scrape engine, the authentication orchestrator, and
/// the cookie vault for one account.
///
/// At most one operation may be in flight at a time per account; concurrent
/// callers risk a lost-update race on cookie persistence.
pub struct CardwatchService {
    engine: ScrapeEngine,
    orchestrator: SsoOrchestrator,
    vault: CookieVault,
    target_host: String,
    bootstrap: Option<String>,
}

impl CardwatchService {
    /// Creates a service for the application at `base_url`, persisting
    /// session state in `vault`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] when the URL is invalid.
    pub fn new(base_url: &str, vault: CookieVault) -> Result<Self, ServiceError> {
        let parsed: Url = base_url.parse().map_err(|_| ServiceError::Config {
            reason: format!("invalid base URL: {base_url}"),
        })?;
        let target_host = parsed
            .host_str()
            .ok_or_else(|| ServiceError::Config {
                reason: "base URL has no host".to_string(),
            })?
            .to_string();

        let engine = ScrapeEngine::new(base_url).map_err(|e| ServiceError::Config {
            reason: e.to_string(),
        })?;
        let landing = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            LOGIN_LANDING_PAGE
        );
        let orchestrator = SsoOrchestrator::new(&landing).map_err(|e| ServiceError::Config {
            reason: e.to_string(),
        })?;

        Ok(Self {
            engine,
            orchestrator,
            vault,
            target_host,
            bootstrap: None,
        })
    }

    /// Supplies a bootstrap cookie blob used when no persisted session
    /// exists yet.
    #[must_use]
    pub fn with_bootstrap(mut self, blob: Option<String>) -> Self {
        self.bootstrap = blob;
        self
    }

    /// Fetches account balances, persisting refreshed cookies on success.
    ///
    /// # Errors
    ///
    /// [`ServiceError::SessionExpired`] when the session is unrecoverable
    /// without interactive login; transport/protocol errors otherwise.
    #[instrument(skip(self))]
    pub async fn get_balances(&self) -> Result<BalanceReport, ServiceError> {
        let mut session = self.load_session()?;
        let accounts = self.engine.fetch_balances(&mut session).await?;
        self.persist_session(&session)?;

        Ok(BalanceReport {
            accounts,
            timestamp: Local::now().to_rfc3339(),
            status: "success".to_string(),
        })
    }

    /// Fetches transaction history for an optional custom date range
    /// (`M/D/YYYY h:mm AM`), persisting refreshed cookies on success.
    ///
    /// # Errors
    ///
    /// Same as [`CardwatchService::get_balances`], plus protocol errors for
    /// unparseable dates.
    #[instrument(skip(self))]
    pub async fn get_transactions(
        &self,
        begin_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<TransactionReport, ServiceError> {
        let mut session = self.load_session()?;
        let transactions = self
            .engine
            .fetch_transactions(&mut session, begin_date, end_date)
            .await?;
        self.persist_session(&session)?;

        Ok(TransactionReport {
            count: transactions.len(),
            transactions,
            begin_date: begin_date.unwrap_or_default().to_string(),
            end_date: end_date.unwrap_or_default().to_string(),
            timestamp: Local::now().to_rfc3339(),
            status: "success".to_string(),
        })
    }

    /// Runs the full interactive login and persists both harvested cookie
    /// sets.
    ///
    /// Long-running (bounded by the second-factor polling budget); must not
    /// be invoked concurrently for the same account.
    ///
    /// # Errors
    ///
    /// Propagates the [`AuthError`] taxonomy unchanged.
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    pub async fn login(&self, credentials: &Credentials) -> Result<LoginReport, ServiceError> {
        let harvest = self.orchestrator.authenticate(credentials).await?;

        self.vault.store(VaultSlot::Target, &harvest.target)?;
        self.vault.store(VaultSlot::Federation, &harvest.federation)?;
        info!(
            target = harvest.target.len(),
            federation = harvest.federation.len(),
            "login complete; session persisted"
        );

        Ok(LoginReport {
            status: "success".to_string(),
            cookies_count: harvest.target.len(),
        })
    }

    /// Imports a bootstrap cookie blob directly into the persisted target
    /// set. Returns the number of cookies stored.
    ///
    /// # Errors
    ///
    /// Returns bootstrap parse errors or storage failures.
    pub fn import_cookies(&self, blob: &str) -> Result<usize, ServiceError> {
        let cookies = import_bootstrap_cookies(blob, &self.target_host)?;
        self.vault.store(VaultSlot::Target, &cookies)?;
        info!(cookies = cookies.len(), "bootstrap cookies persisted");
        Ok(cookies.len())
    }

    /// Removes all persisted session state.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub fn clear_cookies(&self) -> Result<bool, ServiceError> {
        Ok(self.vault.clear()?)
    }

    /// Path of the persisted target cookie set (for user-facing output).
    #[must_use]
    pub fn target_cookie_path(&self) -> std::path::PathBuf {
        self.vault.slot_path(VaultSlot::Target)
    }

    fn load_session(&self) -> Result<SessionContext, ServiceError> {
        let target = match self.vault.load(VaultSlot::Target)? {
            Some(cookies) => {
                info!(cookies = cookies.len(), "loaded persisted target cookies");
                cookies
            }
            None => match &self.bootstrap {
                Some(blob) => {
                    let cookies = import_bootstrap_cookies(blob, &self.target_host)?;
                    info!(cookies = cookies.len(), "imported bootstrap cookies");
                    self.vault.store(VaultSlot::Target, &cookies)?;
                    cookies
                }
                None => {
                    warn!("no persisted or bootstrap cookies; session will be treated as expired");
                    crate::auth::CookieSet::new()
                }
            },
        };

        let federation = self.vault.load(VaultSlot::Federation)?.unwrap_or_default();
        Ok(SessionContext { target, federation })
    }

    fn persist_session(&self, session: &SessionContext) -> Result<(), ServiceError> {
        self.vault.store(VaultSlot::Target, &session.target)?;
        if !session.federation.is_empty() {
            self.vault.store(VaultSlot::Federation, &session.federation)?;
        }
        Ok(())
    }
}
