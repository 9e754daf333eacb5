//! The multi-phase authentication orchestrator.
//!
//! Walks the full chain: target application → identity-provider login form →
//! second-factor challenge → push approval → SAML assertion hand-back →
//! cookie harvest. Every phase can branch, skip, or fail differently; each
//! failure maps to one [`AuthError`] kind and nothing is retried internally.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::CookieSet;
use crate::http::{
    MAX_REDIRECT_HOPS, build_session_client, get_following_redirects, looks_like_login_url,
    post_form_following_redirects, same_origin,
};
use crate::markup::{login_form, page_title};

use super::duo::{self, DuoChallenge, PollTiming, UniversalOutcome};
use super::saml;
use super::{AuthError, Authenticator, CookieHarvest, Credentials};

/// Error strings the identity provider renders on a rejected login.
const INVALID_CREDENTIAL_MARKERS: &[&str] = &[
    "Invalid credentials",
    "Authentication failed",
    "Incorrect login or disabled account",
];

/// Minimum body size of a genuinely authenticated landing page; stub pages
/// are shorter even when they carry account-like markup.
const MIN_AUTHENTICATED_BODY_LEN: usize = 5000;

fn has_account_markup(body: &str) -> bool {
    let Ok(account_sel) = Selector::parse(".account") else {
        return false;
    };
    let doc = Html::parse_document(body);
    doc.select(&account_sel).next().is_some()
}

/// HTTP implementation of the [`Authenticator`] contract.
#[derive(Debug, Clone)]
pub struct SsoOrchestrator {
    target_url: Url,
    target_host: String,
    second_factor_marker: String,
    timing: PollTiming,
}

impl SsoOrchestrator {
    /// Creates an orchestrator for the given target application URL.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Protocol`] when the URL is invalid.
    pub fn new(target_url: &str) -> Result<Self, AuthError> {
        let target_url: Url = target_url
            .parse()
            .map_err(|_| AuthError::protocol(format!("invalid target URL: {target_url}")))?;
        let target_host = target_url
            .host_str()
            .ok_or_else(|| AuthError::protocol("target URL has no host"))?
            .to_string();

        Ok(Self {
            target_url,
            target_host,
            second_factor_marker: "duosecurity.com".to_string(),
            timing: PollTiming::default(),
        })
    }

    /// Overrides the host marker used to recognize the second-factor
    /// provider (used by integration tests).
    #[must_use]
    pub fn with_second_factor_marker(mut self, marker: impl Into<String>) -> Self {
        self.second_factor_marker = marker.into();
        self
    }

    /// Overrides push polling cadence and budget (used by integration
    /// tests).
    #[must_use]
    pub fn with_poll_timing(mut self, timing: PollTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Runs the full login flow, honoring an optional caller deadline at
    /// each push-poll iteration.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] kind matching the failing phase; see the
    /// variant docs. Nothing is retried internally.
    pub async fn authenticate_with_deadline(
        &self,
        credentials: &Credentials,
        deadline: Option<Instant>,
    ) -> Result<CookieHarvest, AuthError> {
        let client = build_session_client(Arc::new(Jar::default()))
            .map_err(|e| AuthError::protocol(format!("HTTP client construction failed: {e}")))?;
        let mut ledger = CookieSet::new();
        let mut hops = Vec::new();

        // Phase 1: navigate to the target, following redirects manually.
        info!(url = %self.target_url, "phase 1: navigating to target");
        let mut page = get_following_redirects(
            &client,
            &mut ledger,
            self.target_url.clone(),
            MAX_REDIRECT_HOPS,
            &mut hops,
        )
        .await?;
        debug!(url = %page.url, title = %page_title(&page.body), "landed");

        // SP-initiated SSO: the target returns an auto-submit request form a
        // browser would post via onload.
        if let Some(form) = saml::find_request_form(&page.body) {
            let action = form.resolved_action(&page.url).ok_or_else(|| {
                AuthError::protocol(format!("unresolvable SAML request action: {}", form.action))
            })?;
            info!(action = %action, "posting SAML authentication request");
            page = post_form_following_redirects(
                &client,
                &mut ledger,
                action,
                &form.fields,
                MAX_REDIRECT_HOPS,
                &mut hops,
            )
            .await?;
        } else if same_origin(&page.url, &self.target_url) {
            if has_account_markup(&page.body) && page.body.len() > MIN_AUTHENTICATED_BODY_LEN {
                info!("already authenticated — session still valid");
                return saml::harvest(&ledger, &self.target_host, &page.url);
            }
            return Err(AuthError::protocol(
                "target returned unexpected page (no SAML form, no accounts)",
            ));
        }

        if !looks_like_login_url(page.url.as_str()) {
            warn!(final_url = %page.url, chain = ?hops, "never reached a login page");
            return Err(AuthError::SessionNotEstablished {
                final_url: page.url.to_string(),
            });
        }

        // Phase 1b: submit credentials to the identity provider.
        let mut form = login_form(&page.body)
            .ok_or_else(|| AuthError::protocol("could not find identity-provider login form"))?;
        form.set_field("username", credentials.username.clone());
        form.set_field("password", credentials.password());
        let action = form.resolved_action(&page.url).ok_or_else(|| {
            AuthError::protocol(format!("unresolvable login form action: {}", form.action))
        })?;
        info!(action = %action, "submitting credentials");
        page = post_form_following_redirects(
            &client,
            &mut ledger,
            action,
            &form.fields,
            MAX_REDIRECT_HOPS,
            &mut hops,
        )
        .await?;

        if INVALID_CREDENTIAL_MARKERS
            .iter()
            .any(|marker| page.body.contains(marker))
        {
            return Err(AuthError::InvalidCredentials);
        }

        // Phase 2: detect and run the second-factor challenge. Detection is
        // centralized here — exactly one variant is active per attempt.
        let challenge = duo::detect_challenge(
            &client,
            &mut ledger,
            &page,
            &self.second_factor_marker,
            &mut hops,
        )
        .await?;

        page = match challenge {
            None => {
                if saml::find_assertion_form(&page.body).is_none() {
                    warn!(url = %page.url, title = %page_title(&page.body), "no challenge or assertion form");
                    return Err(AuthError::ChallengeNotFound);
                }
                info!("no second factor required — assertion found directly");
                page
            }
            Some(DuoChallenge::Iframe(challenge)) => {
                let proof = duo::run_iframe(
                    &client,
                    &mut ledger,
                    &challenge,
                    self.timing,
                    deadline,
                    &mut hops,
                )
                .await?;

                // Phase 3 entry: hand the signed response back to the page
                // that issued the challenge.
                let signed = format!("{proof}:{}", challenge.app);
                info!(action = %challenge.post_action, "posting signed second-factor response");
                post_form_following_redirects(
                    &client,
                    &mut ledger,
                    challenge.post_action.clone(),
                    &[
                        ("signedDuoResponse".to_string(), signed),
                        ("_eventId".to_string(), "submit".to_string()),
                    ],
                    MAX_REDIRECT_HOPS,
                    &mut hops,
                )
                .await?
            }
            Some(DuoChallenge::Universal(challenge)) => {
                let outcome = duo::run_universal(
                    &client,
                    &mut ledger,
                    &challenge,
                    self.timing,
                    deadline,
                    &mut hops,
                )
                .await?;

                match outcome {
                    UniversalOutcome::Completed(page) => page,
                    UniversalOutcome::Parent(url) => {
                        info!(url = %url, "following provider parent redirect");
                        get_following_redirects(
                            &client,
                            &mut ledger,
                            url,
                            MAX_REDIRECT_HOPS,
                            &mut hops,
                        )
                        .await?
                    }
                    UniversalOutcome::Revisit => {
                        info!("revisiting prompt URL for provider redirect");
                        get_following_redirects(
                            &client,
                            &mut ledger,
                            challenge.prompt_url.clone(),
                            MAX_REDIRECT_HOPS,
                            &mut hops,
                        )
                        .await?
                    }
                }
            }
        };

        // Phase 3: chase assertion forms back to the target.
        page =
            saml::follow_assertions(&client, &mut ledger, page, &self.target_url, &mut hops)
                .await?;

        if !same_origin(&page.url, &self.target_url) {
            // The session may already be established even when the chain
            // parked elsewhere; one direct navigation settles it.
            debug!(url = %page.url, "chain ended off-target; navigating directly");
            page = get_following_redirects(
                &client,
                &mut ledger,
                self.target_url.clone(),
                MAX_REDIRECT_HOPS,
                &mut hops,
            )
            .await?;

            if !same_origin(&page.url, &self.target_url) || looks_like_login_url(page.url.as_str()) {
                warn!(final_url = %page.url, chain = ?hops, "session was not established");
                return Err(AuthError::SessionNotEstablished {
                    final_url: page.url.to_string(),
                });
            }
        }

        saml::harvest(&ledger, &self.target_host, &page.url)
    }
}

#[async_trait]
impl Authenticator for SsoOrchestrator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<CookieHarvest, AuthError> {
        self.authenticate_with_deadline(credentials, None).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_url() {
        assert!(matches!(
            SsoOrchestrator::new("not a url"),
            Err(AuthError::Protocol { .. })
        ));
    }

    #[test]
    fn test_new_extracts_target_host() {
        let orchestrator =
            SsoOrchestrator::new("https://eacct.example.com/app/AccountSummary.aspx").unwrap();
        assert_eq!(orchestrator.target_host, "eacct.example.com");
        assert_eq!(orchestrator.second_factor_marker, "duosecurity.com");
    }

    #[test]
    fn test_has_account_markup() {
        assert!(has_account_markup(
            r#"<div class="account"><span class="accountName">Dining</span></div>"#
        ));
        assert!(!has_account_markup("<div class='other'>nothing</div>"));
    }

    #[test]
    fn test_invalid_credential_markers_cover_known_pages() {
        let rejected = "<div class='error'>Invalid credentials.</div>";
        assert!(
            INVALID_CREDENTIAL_MARKERS
                .iter()
                .any(|m| rejected.contains(m))
        );
        let disabled = "Incorrect login or disabled account";
        assert!(
            INVALID_CREDENTIAL_MARKERS
                .iter()
                .any(|m| disabled.contains(m))
        );
    }

}
