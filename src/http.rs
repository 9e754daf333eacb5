//! Shared HTTP client construction policy and manual redirect walking.
//!
//! This module centralizes networking defaults so the authentication and
//! scrape flows stay consistent on timeout, user-agent, compression, and
//! cookie support. Redirects are never followed by the client itself:
//! every flow in this crate needs to observe each hop (to log it, to record
//! Set-Cookie headers, and to detect login redirects), so redirect policy
//! is disabled and [`get_following_redirects`] /
//! [`post_form_following_redirects`] walk the chain explicitly.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, LOCATION};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::auth::CookieSet;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const READ_TIMEOUT_SECS: u64 = 30;

/// Desktop browser user-agent presented on every request.
///
/// The identity provider and the scraped application both serve degraded or
/// blocking pages to obvious non-browser clients.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Maximum redirect hops walked before giving up on a chain.
pub const MAX_REDIRECT_HOPS: usize = 15;

/// Errors from manual redirect walking.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    /// Network-level failure (DNS, connection, TLS, timeout).
    #[error("network error requesting {url}: {source}")]
    Transport {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The chain exceeded the hop cap without reaching a non-redirect response.
    #[error("redirect chain exceeded {max_hops} hops (last: {last_url})")]
    TooManyRedirects {
        /// The configured hop cap.
        max_hops: usize,
        /// The last URL the chain pointed at.
        last_url: String,
    },

    /// A Location header was missing or could not be resolved to a URL.
    #[error("unresolvable redirect from {url}")]
    BadLocation {
        /// The URL whose redirect target could not be resolved.
        url: String,
    },
}

impl WalkError {
    pub(crate) fn transport(url: &Url, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.to_string(),
            source,
        }
    }
}

/// A fully read HTTP response from a manual walk.
#[derive(Debug, Clone)]
pub struct Page {
    /// The URL the response was served from.
    pub url: Url,
    /// The response status.
    pub status: StatusCode,
    /// The decoded response body.
    pub body: String,
}

impl Page {
    /// Host of the URL this page was served from, empty when absent.
    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers
}

/// Builds the session HTTP client used by authentication flows.
///
/// The jar handles Cookie headers automatically across the federation,
/// identity-provider, and second-factor domains; cookie harvesting for
/// persistence happens separately via [`CookieSet::record_response`].
///
/// # Errors
///
/// Returns the underlying builder error when client construction fails.
pub fn build_session_client(jar: Arc<Jar>) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .user_agent(BROWSER_USER_AGENT)
        .gzip(true)
        .redirect(reqwest::redirect::Policy::none())
        .cookie_provider(jar)
        .build()
}

/// Builds the jarless client used by the scrape engine, which constructs its
/// Cookie header manually from the persisted target cookie set.
///
/// # Errors
///
/// Returns the underlying builder error when client construction fails.
pub fn build_plain_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .user_agent(BROWSER_USER_AGENT)
        .gzip(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// True when both URLs share an origin (scheme, host, and port).
///
/// Phase decisions compare origins rather than bare hosts so deployments on
/// non-default ports are handled correctly.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// True when the URL looks like an identity-provider login or SSO page.
#[must_use]
pub fn looks_like_login_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["cas", "login", "sso", "idp"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn resolve_location(current: &Url, response: &reqwest::Response) -> Result<Url, WalkError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| WalkError::BadLocation {
            url: current.to_string(),
        })?;

    current.join(location).map_err(|_| WalkError::BadLocation {
        url: current.to_string(),
    })
}

/// GETs `start` and follows redirects manually up to `max_hops`, recording
/// every observed Set-Cookie header into `ledger` and every hop URL into
/// `hops`.
///
/// # Errors
///
/// Returns [`WalkError`] on network failure, a missing/invalid Location
/// header, or hop-cap exhaustion.
pub async fn get_following_redirects(
    client: &Client,
    ledger: &mut CookieSet,
    start: Url,
    max_hops: usize,
    hops: &mut Vec<String>,
) -> Result<Page, WalkError> {
    let mut url = start;

    for hop in 0..max_hops {
        let response = client
            .get(url.clone())
            .headers(default_headers())
            .send()
            .await
            .map_err(|e| WalkError::transport(&url, e))?;

        let status = response.status();
        ledger.record_response(&url, response.headers());
        hops.push(url.to_string());
        debug!(hop, status = status.as_u16(), url = %url, "redirect walk");

        if status.is_redirection() {
            url = resolve_location(&url, &response)?;
            continue;
        }

        let body = response
            .text()
            .await
            .map_err(|e| WalkError::transport(&url, e))?;
        return Ok(Page { url, status, body });
    }

    Err(WalkError::TooManyRedirects {
        max_hops,
        last_url: url.to_string(),
    })
}

/// POSTs a form to `action`, then follows any redirect chain with GETs.
///
/// Mirrors browser behavior on 3xx after form submission. Cookie and hop
/// recording match [`get_following_redirects`].
///
/// # Errors
///
/// Returns [`WalkError`] on network failure, a missing/invalid Location
/// header, or hop-cap exhaustion.
pub async fn post_form_following_redirects(
    client: &Client,
    ledger: &mut CookieSet,
    action: Url,
    fields: &[(String, String)],
    max_hops: usize,
    hops: &mut Vec<String>,
) -> Result<Page, WalkError> {
    let response = client
        .post(action.clone())
        .headers(default_headers())
        .form(fields)
        .send()
        .await
        .map_err(|e| WalkError::transport(&action, e))?;

    let status = response.status();
    ledger.record_response(&action, response.headers());
    hops.push(action.to_string());
    debug!(status = status.as_u16(), url = %action, "form post");

    if status.is_redirection() {
        let next = resolve_location(&action, &response)?;
        return Box::pin(get_following_redirects(
            client, ledger, next, max_hops, hops,
        ))
        .await;
    }

    let body = response
        .text()
        .await
        .map_err(|e| WalkError::transport(&action, e))?;
    Ok(Page {
        url: action,
        status,
        body,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_login_url_markers() {
        assert!(looks_like_login_url("https://sso.example.edu/cas/login"));
        assert!(looks_like_login_url("https://idp.example.edu/profile"));
        assert!(looks_like_login_url("https://example.edu/Login.aspx"));
        assert!(!looks_like_login_url(
            "https://eacct.example.com/AccountSummary.aspx"
        ));
    }

    #[test]
    fn test_browser_user_agent_is_chrome_like() {
        assert!(BROWSER_USER_AGENT.contains("Mozilla/5.0"));
        assert!(BROWSER_USER_AGENT.contains("Chrome/"));
    }

    #[test]
    fn test_page_host() {
        let page = Page {
            url: "https://eacct.example.com/x".parse().unwrap(),
            status: StatusCode::OK,
            body: String::new(),
        };
        assert_eq!(page.host(), "eacct.example.com");
    }

    #[test]
    fn test_same_origin_ignores_path_but_not_port() {
        let a: Url = "http://127.0.0.1:4001/app/x".parse().unwrap();
        let b: Url = "http://127.0.0.1:4001/other".parse().unwrap();
        let c: Url = "http://127.0.0.1:4002/app/x".parse().unwrap();
        assert!(same_origin(&a, &b));
        assert!(!same_origin(&a, &c));
    }
}
