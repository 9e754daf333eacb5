//! SAML form chasing and the silent session refresher.
//!
//! Assertion forms are auto-submitted by browsers via an onload script; this
//! client locates and submits them explicitly. Chains can pass through more
//! than one assertion hop, so chasing runs as a bounded loop rather than
//! recursion.

use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::CookieSet;
use crate::http::{
    MAX_REDIRECT_HOPS, Page, build_session_client, get_following_redirects, looks_like_login_url,
    post_form_following_redirects, same_origin,
};
use crate::markup::{ExtractedForm, form_with_field, meta_refresh_target, page_title};

use super::{AuthError, CookieHarvest};

/// Finds the SP-initiated `SAMLRequest` auto-submit form (target → IdP).
#[must_use]
pub(crate) fn find_request_form(html: &str) -> Option<ExtractedForm> {
    form_with_field(html, "SAMLRequest")
}

/// Finds a `SAMLResponse` assertion auto-submit form (IdP → target).
#[must_use]
pub(crate) fn find_assertion_form(html: &str) -> Option<ExtractedForm> {
    form_with_field(html, "SAMLResponse")
}

/// Follows the post-authentication chain until no more hops apply:
/// assertion forms are posted, meta refreshes and ticket-bearing IdP URLs
/// are re-fetched, and the loop stops on the target domain or any page with
/// nothing left to follow.
///
/// # Errors
///
/// Returns [`AuthError::Transport`] on network failure or an over-long
/// chain.
pub(crate) async fn follow_assertions(
    client: &Client,
    ledger: &mut CookieSet,
    mut page: Page,
    target_url: &Url,
    hops: &mut Vec<String>,
) -> Result<Page, AuthError> {
    for _ in 0..MAX_REDIRECT_HOPS {
        if same_origin(&page.url, target_url) {
            return Ok(page);
        }

        if let Some(form) = find_assertion_form(&page.body) {
            let action = form.resolved_action(&page.url).ok_or_else(|| {
                AuthError::protocol(format!("unresolvable assertion form action: {}", form.action))
            })?;
            info!(action = %action, "posting SAML assertion");
            page = post_form_following_redirects(
                client,
                ledger,
                action,
                &form.fields,
                MAX_REDIRECT_HOPS,
                hops,
            )
            .await?;
            continue;
        }

        if let Some(refresh) = meta_refresh_target(&page.body) {
            let next = page.url.join(&refresh).map_err(|_| {
                AuthError::protocol(format!("unresolvable meta refresh target: {refresh}"))
            })?;
            debug!(url = %next, "following meta refresh");
            page = get_following_redirects(client, ledger, next, MAX_REDIRECT_HOPS, hops).await?;
            continue;
        }

        // An IdP URL carrying a service ticket resolves on re-fetch.
        if looks_like_login_url(page.url.as_str()) && page.url.as_str().contains("ticket=") {
            debug!(url = %page.url, "re-fetching ticket-bearing URL");
            page = get_following_redirects(
                client,
                ledger,
                page.url.clone(),
                MAX_REDIRECT_HOPS,
                hops,
            )
            .await?;
            continue;
        }

        break;
    }

    Ok(page)
}

/// Harvests the target cookie subset from an authentication walk's ledger.
///
/// # Errors
///
/// Returns [`AuthError::SessionNotEstablished`] when no cookie scoped to the
/// target application was observed.
pub(crate) fn harvest(
    ledger: &CookieSet,
    target_host: &str,
    final_url: &Url,
) -> Result<CookieHarvest, AuthError> {
    let target = ledger.filter_domain(target_host);
    if target.is_empty() {
        warn!(final_url = %final_url, "no target-domain cookies harvested");
        return Err(AuthError::SessionNotEstablished {
            final_url: final_url.to_string(),
        });
    }

    info!(
        target = target.len(),
        federation = ledger.len(),
        "harvested session cookies"
    );
    Ok(CookieHarvest {
        target,
        federation: ledger.clone(),
    })
}

/// Silent re-authentication from federation cookies alone.
///
/// The second factor is the expensive, human-involved step; as long as the
/// federation-wide session is still alive the identity provider will issue a
/// fresh assertion with no interaction, and only the target application's
/// cookies need re-establishing.
#[derive(Debug, Clone)]
pub struct SessionRefresher {
    target_url: Url,
    target_host: String,
}

impl SessionRefresher {
    /// Creates a refresher for the given target application URL.
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
        })
    }

    /// Replays the expired page's `SAMLRequest` form using only federation
    /// cookies and follows the resulting chain.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SessionExpired`] when the federation session is
    /// also dead (the chain lands on a login page, or no usable form/cookies
    /// exist); [`AuthError::Transport`] on network failure.
    pub async fn refresh(
        &self,
        federation: &CookieSet,
        expired_page_body: &str,
    ) -> Result<CookieHarvest, AuthError> {
        if federation.is_empty() {
            warn!("no federation cookies available for silent refresh");
            return Err(AuthError::SessionExpired);
        }

        let Some(form) = find_request_form(expired_page_body) else {
            warn!("expired page carries no SAML request form");
            return Err(AuthError::SessionExpired);
        };

        let action = form
            .resolved_action(&self.target_url)
            .ok_or(AuthError::SessionExpired)?;
        info!(action = %action, cookies = federation.len(), "attempting silent SAML refresh");

        let client = build_session_client(federation.to_jar())
            .map_err(|e| AuthError::protocol(format!("HTTP client construction failed: {e}")))?;
        let mut ledger = federation.clone();
        let mut hops = Vec::new();

        let page = post_form_following_redirects(
            &client,
            &mut ledger,
            action,
            &form.fields,
            MAX_REDIRECT_HOPS,
            &mut hops,
        )
        .await?;
        debug!(url = %page.url, title = %page_title(&page.body), "after SAML request post");

        let page =
            follow_assertions(&client, &mut ledger, page, &self.target_url, &mut hops).await?;

        if same_origin(&page.url, &self.target_url) {
            let outcome = harvest(&ledger, &self.target_host, &page.url);
            return outcome.map_err(|_| AuthError::SessionExpired);
        }

        if looks_like_login_url(page.url.as_str()) {
            info!(url = %page.url, "federation session expired; full login required");
        } else {
            warn!(url = %page.url, "silent refresh ended at unexpected URL");
        }
        Err(AuthError::SessionExpired)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::auth::CookieRecord;

    use super::*;

    const ASSERTION_PAGE: &str = r#"
        <html><body onload="document.forms[0].submit()">
          <form action="https://eacct.example.com/saml/acs" method="post">
            <input type="hidden" name="SAMLResponse" value="assertion-blob"/>
            <input type="hidden" name="RelayState" value="rs"/>
          </form>
        </body></html>"#;

    #[test]
    fn test_find_assertion_form() {
        let form = find_assertion_form(ASSERTION_PAGE).unwrap();
        assert_eq!(form.action, "https://eacct.example.com/saml/acs");
        assert_eq!(form.field("SAMLResponse"), Some("assertion-blob"));
    }

    #[test]
    fn test_find_request_form_distinct_from_assertion() {
        assert!(find_request_form(ASSERTION_PAGE).is_none());
        let request_page = r#"
            <form action="https://idp.example.edu/profile/SAML2/POST/SSO">
              <input type="hidden" name="SAMLRequest" value="req-blob"/>
            </form>"#;
        assert!(find_request_form(request_page).is_some());
        assert!(find_assertion_form(request_page).is_none());
    }

    #[test]
    fn test_harvest_splits_target_from_federation() {
        let mut ledger = CookieSet::new();
        ledger.insert(CookieRecord::new("app", "1", "eacct.example.com", "/"));
        ledger.insert(CookieRecord::new("idp", "2", "sso.example.edu", "/"));
        let final_url: Url = "https://eacct.example.com/done".parse().unwrap();

        let outcome = harvest(&ledger, "eacct.example.com", &final_url).unwrap();
        assert_eq!(outcome.target.len(), 1);
        assert_eq!(outcome.federation.len(), 2);
    }

    #[test]
    fn test_harvest_empty_target_is_error() {
        let mut ledger = CookieSet::new();
        ledger.insert(CookieRecord::new("idp", "2", "sso.example.edu", "/"));
        let final_url: Url = "https://sso.example.edu/stuck".parse().unwrap();

        let result = harvest(&ledger, "eacct.example.com", &final_url);
        assert!(matches!(
            result,
            Err(AuthError::SessionNotEstablished { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_without_federation_cookies_is_expired() {
        let refresher = SessionRefresher::new("https://eacct.example.com/app/x").unwrap();
        let result = refresher.refresh(&CookieSet::new(), ASSERTION_PAGE).await;
        assert!(matches!(result, Err(AuthError::SessionExpired)));
    }

    #[tokio::test]
    async fn test_refresh_without_request_form_is_expired() {
        let refresher = SessionRefresher::new("https://eacct.example.com/app/x").unwrap();
        let mut federation = CookieSet::new();
        federation.insert(CookieRecord::new("idp", "2", "sso.example.edu", "/"));

        let result = refresher.refresh(&federation, "<html>plain page</html>").await;
        assert!(matches!(result, Err(AuthError::SessionExpired)));
    }
}
