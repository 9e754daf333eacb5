//! The two second-factor sub-protocols: the iframe (v2 frame) integration
//! and the universal (v4 frameless) prompt.
//!
//! Both follow the same overall shape — initialize a challenge session,
//! trigger a push, poll a status endpoint until the account holder responds,
//! then fetch an opaque proof — but their endpoints, session bootstrapping,
//! and completion mechanics are incompatible, so each gets its own driver.
//! Detection of which variant a page carries happens in exactly one place,
//! [`detect_challenge`].

use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, REFERER};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::CookieSet;
use crate::http::{
    MAX_REDIRECT_HOPS, Page, get_following_redirects, post_form_following_redirects,
};
use crate::markup::{base_data_json, duo_iframe_params, form_by_id_or_first, input_value};

use super::AuthError;

/// Default wait between status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Default wall-clock budget for push approval.
const DEFAULT_POLL_BUDGET: Duration = Duration::from_secs(90);

static TX_TOKEN_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"(TX\|[^:]+)").unwrap_or_else(|e| panic!("invalid TX regex: {e}"))
});
static APP_TOKEN_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"(APP\|[^:]+)").unwrap_or_else(|e| panic!("invalid APP regex: {e}"))
});

/// Polling cadence and budget for push approval.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    /// Sleep between status checks.
    pub interval: Duration,
    /// Hard wall-clock budget; exhaustion fails the attempt.
    pub budget: Duration,
}

impl PollTiming {
    /// Creates a custom timing (integration tests use millisecond values).
    #[must_use]
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self { interval, budget }
    }
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            budget: DEFAULT_POLL_BUDGET,
        }
    }
}

/// The challenge variant found on an identity-provider page.
///
/// Exactly one variant is active per attempt; the orchestrator dispatches on
/// this exhaustively.
#[derive(Debug, Clone)]
pub enum DuoChallenge {
    /// iframe (v2 frame) integration: signed request tokens embedded in the
    /// provider page, proof posted back as a signed response field.
    Iframe(IframeChallenge),
    /// Universal (v4 frameless) prompt: the provider hosts the page itself
    /// and completion follows a provider-issued redirect chain.
    Universal(UniversalChallenge),
}

/// Parameters of an iframe-style challenge.
#[derive(Debug, Clone)]
pub struct IframeChallenge {
    /// Challenge API origin (scheme + host).
    pub api_base: Url,
    /// Transaction token from the signed request.
    pub tx: String,
    /// Application token from the signed request; concatenated into the
    /// signed response.
    pub app: String,
    /// URL the signed response is posted back to.
    pub post_action: Url,
}

/// Parameters of a universal-prompt challenge.
#[derive(Debug, Clone)]
pub struct UniversalChallenge {
    /// Challenge API origin (scheme + host).
    pub api_base: Url,
    /// The hosted prompt URL (carries the session id in its query).
    pub prompt_url: Url,
    /// The prompt page body (carries the device-fingerprint form).
    pub html: String,
}

/// How a completed universal challenge hands control back to the identity
/// provider.
#[derive(Debug)]
pub(crate) enum UniversalOutcome {
    /// Follow this provider-issued redirect URL.
    Parent(Url),
    /// The result endpoint already returned the continuation page.
    Completed(Page),
    /// Only an opaque proof came back; revisit the prompt URL to pick up the
    /// redirect to the identity provider.
    Revisit,
}

#[derive(Debug, Deserialize)]
struct FrameResponse {
    stat: Option<String>,
    #[serde(default)]
    response: FrameBody,
}

#[derive(Debug, Default, Deserialize)]
struct FrameBody {
    txid: Option<String>,
    status_code: Option<String>,
    status: Option<String>,
    result_url: Option<String>,
    cookie: Option<String>,
    parent: Option<String>,
}

fn origin_of(url: &Url) -> Result<Url, AuthError> {
    url.origin()
        .ascii_serialization()
        .parse()
        .map_err(|_| AuthError::protocol(format!("cannot derive origin of {url}")))
}

fn api_url(base: &Url, path: &str) -> Result<Url, AuthError> {
    base.join(path)
        .map_err(|_| AuthError::protocol(format!("cannot build challenge URL {path}")))
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Detects which challenge variant a post-credential page carries, if any.
///
/// This is the single place variant detection happens. A meta refresh
/// pointing at the second-factor host is followed with one GET to obtain the
/// hosted prompt page.
///
/// # Errors
///
/// Returns [`AuthError::Transport`] if following a meta refresh fails, or
/// [`AuthError::Protocol`] when challenge parameters are malformed.
pub(crate) async fn detect_challenge(
    client: &Client,
    ledger: &mut CookieSet,
    page: &Page,
    second_factor_marker: &str,
    hops: &mut Vec<String>,
) -> Result<Option<DuoChallenge>, AuthError> {
    if let Some(params) = duo_iframe_params(&page.body) {
        let tx = TX_TOKEN_RE
            .captures(&params.sig_request)
            .map(|c| c[1].to_string());
        let app = APP_TOKEN_RE
            .captures(&params.sig_request)
            .map(|c| c[1].to_string());
        let (Some(tx), Some(app)) = (tx, app) else {
            return Err(AuthError::protocol(
                "could not parse TX/APP tokens from signed request",
            ));
        };

        let api_base: Url = format!("{}://{}", page.url.scheme(), params.host)
            .parse()
            .map_err(|_| {
                AuthError::protocol(format!("invalid challenge host: {}", params.host))
            })?;
        let post_action = match &params.post_action {
            Some(action) => page.url.join(action).map_err(|_| {
                AuthError::protocol(format!("unresolvable challenge post action: {action}"))
            })?,
            None => page.url.clone(),
        };

        info!(host = %params.host, "iframe second-factor challenge detected");
        return Ok(Some(DuoChallenge::Iframe(IframeChallenge {
            api_base,
            tx,
            app,
            post_action,
        })));
    }

    if page.host().contains(second_factor_marker) {
        info!(url = %page.url, "universal second-factor prompt detected");
        return Ok(Some(DuoChallenge::Universal(UniversalChallenge {
            api_base: origin_of(&page.url)?,
            prompt_url: page.url.clone(),
            html: page.body.clone(),
        })));
    }

    if let Some(refresh) = crate::markup::meta_refresh_target(&page.body)
        && refresh.contains(second_factor_marker)
    {
        let next = page.url.join(&refresh).map_err(|_| {
            AuthError::protocol(format!("unresolvable meta refresh target: {refresh}"))
        })?;
        debug!(url = %next, "meta refresh to second-factor prompt");
        let prompt = get_following_redirects(client, ledger, next, MAX_REDIRECT_HOPS, hops).await?;
        return Ok(Some(DuoChallenge::Universal(UniversalChallenge {
            api_base: origin_of(&prompt.url)?,
            prompt_url: prompt.url.clone(),
            html: prompt.body,
        })));
    }

    Ok(None)
}

fn xhr_headers(referer: &Url) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/plain, */*; q=0.01"));
    headers.insert(
        "X-Requested-With",
        HeaderValue::from_static("XMLHttpRequest"),
    );
    if let Ok(value) = HeaderValue::from_str(referer.as_str()) {
        headers.insert(REFERER, value);
    }
    headers
}

async fn post_json(
    client: &Client,
    url: Url,
    fields: &[(String, String)],
    headers: HeaderMap,
) -> Result<FrameResponse, AuthError> {
    let response = client
        .post(url.clone())
        .headers(headers)
        .form(fields)
        .send()
        .await
        .map_err(|e| crate::http::WalkError::transport(&url, e))?;
    let body = response
        .text()
        .await
        .map_err(|e| crate::http::WalkError::transport(&url, e))?;
    serde_json::from_str(&body)
        .map_err(|_| AuthError::protocol(format!("challenge endpoint returned non-JSON: {url}")))
}

/// Approval details from an `allow` status.
struct Approval {
    result_url: Option<String>,
}

/// Polls a status endpoint until the push is resolved or time runs out.
///
/// One status check per interval, bounded by the budget; a caller-supplied
/// deadline is honored at each iteration. A denied or timed-out push is a
/// terminal user decision — never retried here.
async fn poll_push(
    client: &Client,
    status_url: Url,
    fields: Vec<(String, String)>,
    headers: HeaderMap,
    timing: PollTiming,
    deadline: Option<Instant>,
) -> Result<Approval, AuthError> {
    let started = Instant::now();
    let timed_out = || AuthError::ChallengeTimedOut {
        budget_secs: timing.budget.as_secs(),
    };

    while started.elapsed() < timing.budget {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            warn!("caller deadline reached while waiting for push approval");
            return Err(timed_out());
        }

        tokio::time::sleep(timing.interval).await;

        let status = post_json(client, status_url.clone(), &fields, headers.clone()).await?;
        let code = status.response.status_code.as_deref().unwrap_or_default();
        debug!(
            status = code,
            detail = status.response.status.as_deref().unwrap_or_default(),
            "push status"
        );

        match code {
            "allow" => {
                info!("push approved");
                return Ok(Approval {
                    result_url: status.response.result_url,
                });
            }
            "deny" => return Err(AuthError::ChallengeDenied),
            "timeout" => return Err(timed_out()),
            _ => {}
        }
    }

    warn!(budget_secs = timing.budget.as_secs(), "push approval budget exhausted");
    Err(timed_out())
}

/// Runs the iframe (v2 frame) sub-protocol and returns the opaque auth
/// cookie to embed in the signed response.
///
/// # Errors
///
/// Returns [`AuthError::ChallengeDenied`] / [`AuthError::ChallengeTimedOut`]
/// on the corresponding push outcomes, [`AuthError::Transport`] on network
/// failure, and [`AuthError::Protocol`] on malformed provider responses.
pub(crate) async fn run_iframe(
    client: &Client,
    ledger: &mut CookieSet,
    challenge: &IframeChallenge,
    timing: PollTiming,
    deadline: Option<Instant>,
    hops: &mut Vec<String>,
) -> Result<String, AuthError> {
    // Initialize the challenge session with browser fingerprint fields.
    let mut auth_url = api_url(&challenge.api_base, "/frame/web/v1/auth")?;
    auth_url
        .query_pairs_mut()
        .append_pair("tx", &challenge.tx)
        .append_pair("parent", challenge.post_action.as_str())
        .append_pair("v", "2.6");

    let fingerprint = vec![
        ("parent".to_string(), challenge.post_action.to_string()),
        ("java_version".to_string(), String::new()),
        ("flash_version".to_string(), String::new()),
        ("screen_resolution_width".to_string(), "1920".to_string()),
        ("screen_resolution_height".to_string(), "1080".to_string()),
        ("color_depth".to_string(), "24".to_string()),
        ("is_cef_browser".to_string(), "false".to_string()),
        ("is_ipad_os".to_string(), "false".to_string()),
    ];

    let page = post_form_following_redirects(
        client,
        ledger,
        auth_url,
        &fingerprint,
        MAX_REDIRECT_HOPS,
        hops,
    )
    .await?;

    let Some(sid) = query_param(&page.url, "sid") else {
        // A remembered device bypasses the push entirely; the page carries
        // the proof in a hidden input instead of a session id.
        if let Some(proof) = input_value(&page.body, "js_cookie") {
            info!("remembered device — skipping push");
            return Ok(proof);
        }
        warn!(url = %page.url, "no session id in challenge redirect");
        return Err(AuthError::protocol("failed to get second-factor session id"));
    };
    debug!(sid_prefix = &sid[..sid.len().min(8)], "challenge session established");

    // Trigger the push.
    let prompt_url = api_url(&challenge.api_base, "/frame/prompt")?;
    let headers = xhr_headers(&prompt_url);
    let prompt_fields = vec![
        ("sid".to_string(), sid.clone()),
        ("factor".to_string(), "Duo Push".to_string()),
        ("device".to_string(), "phone1".to_string()),
        ("postAuthDestination".to_string(), "OIDC_EXIT".to_string()),
        ("out_of_date".to_string(), String::new()),
        ("days_out_of_date".to_string(), String::new()),
        ("days_to_block".to_string(), "None".to_string()),
    ];
    let prompt = post_json(client, prompt_url, &prompt_fields, headers.clone()).await?;
    if prompt.stat.as_deref() != Some("OK") {
        return Err(AuthError::protocol(format!(
            "push trigger failed (stat: {})",
            prompt.stat.as_deref().unwrap_or("missing")
        )));
    }
    let txid = prompt
        .response
        .txid
        .ok_or_else(|| AuthError::protocol("push trigger response carries no txid"))?;
    info!("push sent; waiting for approval");

    // Poll until resolved.
    let status_url = api_url(&challenge.api_base, "/frame/status")?;
    let status_fields = vec![
        ("sid".to_string(), sid.clone()),
        ("txid".to_string(), txid),
    ];
    let approval = poll_push(
        client,
        status_url,
        status_fields,
        headers.clone(),
        timing,
        deadline,
    )
    .await?;

    // Fetch the opaque auth cookie from the result endpoint.
    let result_path = approval
        .result_url
        .ok_or_else(|| AuthError::protocol("approval carries no result URL"))?;
    let result_url = api_url(&challenge.api_base, &result_path)?;
    let result = post_json(
        client,
        result_url,
        &[("sid".to_string(), sid)],
        headers,
    )
    .await?;

    result
        .response
        .cookie
        .filter(|cookie| !cookie.is_empty())
        .ok_or_else(|| AuthError::protocol("approval result carries no auth cookie"))
}

/// Runs the universal (v4 frameless) sub-protocol.
///
/// The preliminary device-fingerprint form must be submitted first — the
/// provider hard-fails the prompt API otherwise. The provider's
/// session-scoped cookies are carried verbatim in a manually built `Cookie`
/// header because their names cannot live in a standard jar.
///
/// # Errors
///
/// Same taxonomy as [`run_iframe`].
pub(crate) async fn run_universal(
    client: &Client,
    ledger: &mut CookieSet,
    challenge: &UniversalChallenge,
    timing: PollTiming,
    deadline: Option<Instant>,
    hops: &mut Vec<String>,
) -> Result<UniversalOutcome, AuthError> {
    let mut sid = query_param(&challenge.prompt_url, "sid");
    let mut xsrf_token: Option<String> = None;

    if let Some(mut form) = form_by_id_or_first(&challenge.html, "plugin_form") {
        for (name, value) in [
            ("screen_resolution_width", "1920"),
            ("screen_resolution_height", "1080"),
            ("color_depth", "24"),
            ("is_cef_browser", "false"),
            ("is_ipad_os", "false"),
            ("is_ie_compatibility_mode", ""),
            (
                "is_user_verifying_platform_authenticator_available",
                "false",
            ),
            ("react_support", "true"),
        ] {
            form.set_field(name, value);
        }
        xsrf_token = form.field("_xsrf").map(ToString::to_string);

        debug!(fields = form.fields.len(), "submitting device-fingerprint form");
        let page = post_form_following_redirects(
            client,
            ledger,
            challenge.prompt_url.clone(),
            &form.fields,
            MAX_REDIRECT_HOPS,
            hops,
        )
        .await?;

        if let Some(base_data) = base_data_json(&page.body)
            && let Some(token) = base_data.get("xsrf_token").and_then(|v| v.as_str())
        {
            xsrf_token = Some(token.to_string());
        }
        if let Some(fresh) = query_param(&page.url, "sid") {
            sid = Some(fresh);
        }
    }

    let sid = sid.ok_or_else(|| {
        AuthError::protocol("could not extract session id from universal prompt")
    })?;

    // Session-scoped cookies by hand: names like `sid|{uuid}` cannot
    // round-trip through a standard jar.
    let provider_host = challenge.api_base.host_str().unwrap_or_default();
    let provider_cookies = ledger.filter_domain(provider_host);
    let cookie_header = provider_cookies.cookie_header();
    debug!(
        cookies = provider_cookies.len(),
        "carrying provider session cookies manually"
    );

    let referer = api_url(
        &challenge.api_base,
        &format!("/frame/v4/auth/prompt?sid={sid}"),
    )?;
    let mut headers = xhr_headers(&referer);
    if let Some(token) = &xsrf_token
        && let Ok(value) = HeaderValue::from_str(token)
    {
        headers.insert("X-Xsrftoken", value);
    }
    if !cookie_header.is_empty()
        && let Ok(value) = HeaderValue::from_str(&cookie_header)
    {
        headers.insert(reqwest::header::COOKIE, value);
    }

    let browser_features = serde_json::json!({
        "touch_supported": false,
        "platform_authenticator_status": "available",
        "webauthn_supported": true,
        "screen_resolution_height": 915,
        "screen_resolution_width": 1463,
        "screen_color_depth": 24,
        "is_uvpa_available": true,
        "client_capabilities_uvpa": true,
    })
    .to_string();

    // Prompt-data GET initializes the session; skipping it yields a hard
    // protocol error from the provider.
    let mut data_url = api_url(&challenge.api_base, "/frame/v4/auth/prompt/data")?;
    data_url
        .query_pairs_mut()
        .append_pair("post_auth_action", "OIDC_EXIT")
        .append_pair("browser_features", &browser_features)
        .append_pair("sid", &sid);
    let data_response = client
        .get(data_url.clone())
        .headers(headers.clone())
        .send()
        .await
        .map_err(|e| crate::http::WalkError::transport(&data_url, e))?;
    debug!(status = data_response.status().as_u16(), "prompt data fetched");

    // Trigger the push.
    let prompt_url = api_url(&challenge.api_base, "/frame/v4/prompt")?;
    let prompt_fields = vec![
        ("device".to_string(), "phone1".to_string()),
        ("factor".to_string(), "Duo Push".to_string()),
        ("postAuthDestination".to_string(), "OIDC_EXIT".to_string()),
        ("browser_features".to_string(), browser_features.clone()),
        ("sid".to_string(), sid.clone()),
    ];
    let prompt = post_json(client, prompt_url, &prompt_fields, headers.clone()).await?;
    if prompt.stat.as_deref() != Some("OK") {
        return Err(AuthError::protocol(format!(
            "push trigger failed (stat: {})",
            prompt.stat.as_deref().unwrap_or("missing")
        )));
    }
    let txid = prompt
        .response
        .txid
        .ok_or_else(|| AuthError::protocol("push trigger response carries no txid"))?;
    info!("push sent; waiting for approval");

    // Poll until resolved.
    let status_url = api_url(&challenge.api_base, "/frame/v4/status")?;
    let status_fields = vec![
        ("txid".to_string(), txid),
        ("sid".to_string(), sid.clone()),
    ];
    let approval = poll_push(
        client,
        status_url,
        status_fields,
        headers.clone(),
        timing,
        deadline,
    )
    .await?;

    let Some(result_path) = approval.result_url else {
        return Err(AuthError::protocol("approval carries no result URL"));
    };
    let result_url = api_url(&challenge.api_base, &result_path)?;

    let response = client
        .post(result_url.clone())
        .headers(headers)
        .form(&[("sid", sid.as_str())])
        .send()
        .await
        .map_err(|e| crate::http::WalkError::transport(&result_url, e))?;
    ledger.record_response(&result_url, response.headers());

    if response.status().is_redirection() {
        // The provider hands control back via a redirect to the identity
        // provider's resume URL.
        if let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            && let Ok(next) = result_url.join(location)
        {
            let page =
                get_following_redirects(client, ledger, next, MAX_REDIRECT_HOPS, hops).await?;
            return Ok(UniversalOutcome::Completed(page));
        }
        return Err(AuthError::protocol("result redirect without location"));
    }

    let status = response.status();
    let final_url = response.url().clone();
    let body = response
        .text()
        .await
        .map_err(|e| crate::http::WalkError::transport(&result_url, e))?;

    if let Ok(parsed) = serde_json::from_str::<FrameResponse>(&body) {
        if let Some(parent) = parsed.response.parent.filter(|p| !p.is_empty()) {
            let parent_url = result_url.join(&parent).map_err(|_| {
                AuthError::protocol(format!("unresolvable parent redirect: {parent}"))
            })?;
            return Ok(UniversalOutcome::Parent(parent_url));
        }
        // Opaque proof only — the prompt URL revisit picks up the redirect.
        return Ok(UniversalOutcome::Revisit);
    }

    // Non-JSON result: the continuation page itself.
    Ok(UniversalOutcome::Completed(Page {
        url: final_url,
        status,
        body,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timing_defaults() {
        let timing = PollTiming::default();
        assert_eq!(timing.interval, Duration::from_secs(3));
        assert_eq!(timing.budget, Duration::from_secs(90));
    }

    #[test]
    fn test_tx_app_token_parsing() {
        let sig = "TX|dGVzdA==|sig:APP|YXBw|sig2";
        let tx = TX_TOKEN_RE.captures(sig).unwrap()[1].to_string();
        let app = APP_TOKEN_RE.captures(sig).unwrap()[1].to_string();
        assert_eq!(tx, "TX|dGVzdA==|sig");
        assert_eq!(app, "APP|YXBw|sig2");
    }

    #[test]
    fn test_query_param() {
        let url: Url = "https://api-x.duosecurity.com/frame?sid=s-123&x=1"
            .parse()
            .unwrap();
        assert_eq!(query_param(&url, "sid").unwrap(), "s-123");
        assert!(query_param(&url, "missing").is_none());
    }

    #[test]
    fn test_origin_of_strips_path_and_query() {
        let url: Url = "http://127.0.0.1:8080/frame/v4/auth?sid=1".parse().unwrap();
        assert_eq!(origin_of(&url).unwrap().as_str(), "http://127.0.0.1:8080/");
    }
}
