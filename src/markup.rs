//! HTML extraction for server-rendered pages: hidden form fields, SAML
//! auto-submit forms, identity-provider login forms, second-factor challenge
//! parameters, and dropdown defaults.
//!
//! Everything here is read-only over page markup; the callers decide what a
//! missing form or field means for their protocol phase.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Compiles a regex at static init; panics on invalid pattern.
fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

/// Compiles a known-good CSS selector; panics on invalid pattern.
fn selector(pattern: &str) -> Selector {
    Selector::parse(pattern).unwrap_or_else(|e| panic!("invalid selector '{pattern}': {e}"))
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<title>(.*?)</title>"));
static META_URL_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?i)url=(.+)"));
static DUO_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"['"]host['"]\s*:\s*['"]([^'"]+)['"]"#));
static DUO_SIG_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"['"]sig_request['"]\s*:\s*['"]([^'"]+)['"]"#));
static DUO_POST_ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"['"]post_action['"]\s*:\s*['"]([^'"]+)['"]"#));

/// A form lifted out of page markup: its action and named input values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedForm {
    /// The raw `action` attribute (may be relative or empty).
    pub action: String,
    /// Named input values in document order.
    pub fields: Vec<(String, String)>,
}

impl ExtractedForm {
    /// Resolves the form action against the page it came from.
    ///
    /// An empty action posts back to the page URL, matching browser behavior.
    #[must_use]
    pub fn resolved_action(&self, page_url: &Url) -> Option<Url> {
        if self.action.is_empty() {
            return Some(page_url.clone());
        }
        page_url.join(&self.action).ok()
    }

    /// Looks up a field value by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        field_value(&self.fields, name)
    }

    /// Sets a field, replacing an existing value or appending.
    pub fn set_field(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.fields.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }
}

/// Second-factor challenge parameters embedded in an identity-provider page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuoIframeParams {
    /// The challenge API host.
    pub host: String,
    /// The signed request blob (`TX|...:APP|...`).
    pub sig_request: String,
    /// URL the signed response must be posted back to, when the page names
    /// one explicitly.
    pub post_action: Option<String>,
}

/// Looks up a field value in a name/value list.
#[must_use]
pub fn field_value<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn named_inputs(form: ElementRef<'_>, input_sel: &Selector) -> Vec<(String, String)> {
    form.select(input_sel)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            if name.is_empty() {
                return None;
            }
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn form_to_extracted(form: ElementRef<'_>) -> ExtractedForm {
    ExtractedForm {
        action: form.value().attr("action").unwrap_or_default().to_string(),
        fields: named_inputs(form, &selector("input")),
    }
}

/// Extracts every hidden input on the page as a name/value list.
#[must_use]
pub fn hidden_fields(html: &str) -> Vec<(String, String)> {
    let doc = Html::parse_document(html);
    doc.select(&selector(r#"input[type="hidden"]"#))
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            if name.is_empty() {
                return None;
            }
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Finds the first form containing an input with the given name.
///
/// Used to locate SAML auto-submit forms (`SAMLRequest` on the way to the
/// identity provider, `SAMLResponse` on the way back).
#[must_use]
pub fn form_with_field(html: &str, field_name: &str) -> Option<ExtractedForm> {
    let doc = Html::parse_document(html);
    let input_sel = selector("input");
    doc.select(&selector("form"))
        .find(|form| {
            form.select(&input_sel)
                .any(|input| input.value().attr("name") == Some(field_name))
        })
        .map(form_to_extracted)
}

/// Finds the identity-provider login form: `form#fm1` or the first form.
#[must_use]
pub fn login_form(html: &str) -> Option<ExtractedForm> {
    form_by_id_or_first(html, "fm1")
}

/// Finds a form by element id, falling back to the first form on the page.
#[must_use]
pub fn form_by_id_or_first(html: &str, id: &str) -> Option<ExtractedForm> {
    let doc = Html::parse_document(html);
    let by_id = Selector::parse(&format!("form#{id}")).ok()?;
    doc.select(&by_id)
        .next()
        .or_else(|| doc.select(&selector("form")).next())
        .map(form_to_extracted)
}

/// Returns the value of the first input with the given name.
#[must_use]
pub fn input_value(html: &str, name: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(&selector("input")).find_map(|input| {
        if input.value().attr("name") == Some(name) {
            Some(input.value().attr("value").unwrap_or_default().to_string())
        } else {
            None
        }
    })
}

/// Returns the selected option value of a `<select>` element, falling back
/// to the first option when none is marked selected.
#[must_use]
pub fn selected_option(html: &str, select_id: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let select_sel = Selector::parse(&format!("select#{select_id}")).ok()?;
    let select = doc.select(&select_sel).next()?;

    let option = select
        .select(&selector("option[selected]"))
        .next()
        .or_else(|| select.select(&selector("option")).next())?;
    Some(option.value().attr("value").unwrap_or_default().to_string())
}

/// Extracts the target URL of a `<meta http-equiv="refresh">` tag, if any.
#[must_use]
pub fn meta_refresh_target(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(&selector("meta")).find_map(|meta| {
        let http_equiv = meta.value().attr("http-equiv")?;
        if !http_equiv.eq_ignore_ascii_case("refresh") {
            return None;
        }
        let content = meta.value().attr("content")?;
        META_URL_RE.captures(content).map(|caps| {
            caps[1]
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string()
        })
    })
}

/// Extracts the page title, `(no title)` when absent.
#[must_use]
pub fn page_title(html: &str) -> String {
    TITLE_RE
        .captures(html)
        .map_or_else(|| "(no title)".to_string(), |caps| caps[1].trim().to_string())
}

/// Extracts iframe-style second-factor challenge parameters from a page.
///
/// Checks hidden inputs first, then script literals, then `data-` attributes
/// on the challenge iframe element. Returns `None` unless both a host and a
/// signed request are present.
#[must_use]
pub fn duo_iframe_params(html: &str) -> Option<DuoIframeParams> {
    let doc = Html::parse_document(html);

    let mut host: Option<String> = None;
    let mut sig_request: Option<String> = None;
    let mut post_action: Option<String> = None;

    for input in doc.select(&selector(r#"input[type="hidden"]"#)) {
        let name = input
            .value()
            .attr("name")
            .unwrap_or_default()
            .to_ascii_lowercase();
        let value = input.value().attr("value").unwrap_or_default();
        if value.is_empty() {
            continue;
        }
        if name.contains("duo_host") || name == "duohost" {
            host.get_or_insert_with(|| value.to_string());
        } else if name.contains("sig_request") || name == "duosigrequest" {
            sig_request.get_or_insert_with(|| value.to_string());
        }
    }

    for script in doc.select(&selector("script")) {
        let text: String = script.text().collect();
        if host.is_none() {
            host = DUO_HOST_RE.captures(&text).map(|c| c[1].to_string());
        }
        if sig_request.is_none() {
            sig_request = DUO_SIG_RE.captures(&text).map(|c| c[1].to_string());
        }
        if post_action.is_none() {
            post_action = DUO_POST_ACTION_RE.captures(&text).map(|c| c[1].to_string());
        }
    }

    if let Some(iframe) = doc.select(&selector("iframe#duo_iframe")).next() {
        let attr = |name: &str| {
            iframe
                .value()
                .attr(name)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };
        host = host.or_else(|| attr("data-host"));
        sig_request = sig_request.or_else(|| attr("data-sig-request"));
        post_action = post_action.or_else(|| attr("data-post-action"));
    }

    Some(DuoIframeParams {
        host: host?,
        sig_request: sig_request?,
        post_action,
    })
}

/// Parses the JSON document embedded in `script#base-data`, used by the
/// frameless second-factor prompt to carry its session metadata.
#[must_use]
pub fn base_data_json(html: &str) -> Option<serde_json::Value> {
    let doc = Html::parse_document(html);
    let script = doc.select(&selector("script#base-data")).next()?;
    let text: String = script.text().collect();
    serde_json::from_str(text.trim()).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_fields_extracts_name_value_pairs_in_order() {
        let html = r#"
            <form>
              <input type="hidden" name="__VIEWSTATE" value="vs1"/>
              <input type="hidden" name="__EVENTVALIDATION" value="ev1"/>
              <input type="text" name="visible" value="nope"/>
              <input type="hidden" value="nameless"/>
            </form>"#;
        let fields = hidden_fields(html);
        assert_eq!(
            fields,
            vec![
                ("__VIEWSTATE".to_string(), "vs1".to_string()),
                ("__EVENTVALIDATION".to_string(), "ev1".to_string()),
            ]
        );
        assert_eq!(field_value(&fields, "__VIEWSTATE"), Some("vs1"));
        assert_eq!(field_value(&fields, "missing"), None);
    }

    #[test]
    fn test_form_with_field_finds_saml_request_form() {
        let html = r#"
            <form action="/other"><input name="unrelated" value="x"/></form>
            <form action="https://idp.example.edu/sso/post" method="post">
              <input type="hidden" name="SAMLRequest" value="b64blob"/>
              <input type="hidden" name="RelayState" value="rs"/>
            </form>"#;
        let form = form_with_field(html, "SAMLRequest").unwrap();
        assert_eq!(form.action, "https://idp.example.edu/sso/post");
        assert_eq!(form.field("SAMLRequest"), Some("b64blob"));
        assert_eq!(form.field("RelayState"), Some("rs"));
    }

    #[test]
    fn test_form_with_field_absent_returns_none() {
        assert!(form_with_field("<form><input name='a'/></form>", "SAMLResponse").is_none());
    }

    #[test]
    fn test_login_form_prefers_fm1() {
        let html = r#"
            <form id="search" action="/search"></form>
            <form id="fm1" action="/cas/login">
              <input type="hidden" name="execution" value="e1s1"/>
              <input type="hidden" name="_eventId" value="submit"/>
            </form>"#;
        let form = login_form(html).unwrap();
        assert_eq!(form.action, "/cas/login");
        assert_eq!(form.field("execution"), Some("e1s1"));
    }

    #[test]
    fn test_login_form_falls_back_to_first_form() {
        let html = r#"<form action="/login"><input name="lt" value="t"/></form>"#;
        assert_eq!(login_form(html).unwrap().action, "/login");
    }

    #[test]
    fn test_resolved_action_relative_and_empty() {
        let page: Url = "https://sso.example.edu/cas/login?service=x".parse().unwrap();
        let relative = ExtractedForm {
            action: "/cas/login".to_string(),
            fields: vec![],
        };
        assert_eq!(
            relative.resolved_action(&page).unwrap().as_str(),
            "https://sso.example.edu/cas/login"
        );

        let empty = ExtractedForm {
            action: String::new(),
            fields: vec![],
        };
        assert_eq!(empty.resolved_action(&page).unwrap(), page);
    }

    #[test]
    fn test_set_field_replaces_and_appends() {
        let mut form = ExtractedForm {
            action: String::new(),
            fields: vec![("username".to_string(), String::new())],
        };
        form.set_field("username", "gburdell3");
        form.set_field("password", "hunter2");
        assert_eq!(form.field("username"), Some("gburdell3"));
        assert_eq!(form.field("password"), Some("hunter2"));
        assert_eq!(form.fields.len(), 2);
    }

    #[test]
    fn test_selected_option_prefers_selected_attribute() {
        let html = r#"
            <select id="MainContent_Accounts">
              <option value="all">All</option>
              <option value="dining" selected>Dining</option>
            </select>"#;
        assert_eq!(
            selected_option(html, "MainContent_Accounts").unwrap(),
            "dining"
        );
    }

    #[test]
    fn test_selected_option_falls_back_to_first() {
        let html = r#"
            <select id="MainContent_TransactionType">
              <option value="any">Any</option>
              <option value="debit">Debit</option>
            </select>"#;
        assert_eq!(
            selected_option(html, "MainContent_TransactionType").unwrap(),
            "any"
        );
        assert!(selected_option(html, "Missing").is_none());
    }

    #[test]
    fn test_meta_refresh_target() {
        let html = r#"<meta http-equiv="Refresh" content="0; url=https://api-x.duosecurity.com/frame?sid=1">"#;
        assert_eq!(
            meta_refresh_target(html).unwrap(),
            "https://api-x.duosecurity.com/frame?sid=1"
        );
        assert!(meta_refresh_target("<meta charset='utf-8'>").is_none());
    }

    #[test]
    fn test_page_title() {
        assert_eq!(page_title("<title> CAS Login </title>"), "CAS Login");
        assert_eq!(page_title("<body>no title</body>"), "(no title)");
    }

    #[test]
    fn test_duo_iframe_params_from_hidden_inputs() {
        let html = r#"
            <input type="hidden" name="duo_host" value="api-x.duosecurity.com"/>
            <input type="hidden" name="duo_sig_request" value="TX|abc:APP|def"/>"#;
        let params = duo_iframe_params(html).unwrap();
        assert_eq!(params.host, "api-x.duosecurity.com");
        assert_eq!(params.sig_request, "TX|abc:APP|def");
        assert!(params.post_action.is_none());
    }

    #[test]
    fn test_duo_iframe_params_from_script_literals() {
        let html = r#"
            <script>
              Duo.init({
                'host': 'api-x.duosecurity.com',
                'sig_request': 'TX|abc:APP|def',
                'post_action': '/cas/login?execution=e1s2'
              });
            </script>"#;
        let params = duo_iframe_params(html).unwrap();
        assert_eq!(params.host, "api-x.duosecurity.com");
        assert_eq!(
            params.post_action.as_deref(),
            Some("/cas/login?execution=e1s2")
        );
    }

    #[test]
    fn test_duo_iframe_params_from_data_attributes() {
        let html = r#"<iframe id="duo_iframe"
            data-host="api-x.duosecurity.com"
            data-sig-request="TX|abc:APP|def"
            data-post-action="/duo/callback"></iframe>"#;
        let params = duo_iframe_params(html).unwrap();
        assert_eq!(params.host, "api-x.duosecurity.com");
        assert_eq!(params.post_action.as_deref(), Some("/duo/callback"));
    }

    #[test]
    fn test_duo_iframe_params_missing_sig_is_none() {
        let html = r#"<input type="hidden" name="duo_host" value="api-x.duosecurity.com"/>"#;
        assert!(duo_iframe_params(html).is_none());
    }

    #[test]
    fn test_base_data_json() {
        let html = r#"<script id="base-data" type="application/json">
            {"xsrf_token": "tok123", "sid": "s-1"}
        </script>"#;
        let data = base_data_json(html).unwrap();
        assert_eq!(data["xsrf_token"], "tok123");
        assert!(base_data_json("<script>var x = 1;</script>").is_none());
    }

    #[test]
    fn test_input_value() {
        let html = r#"<input name="js_cookie" value="remembered-proof"/>"#;
        assert_eq!(input_value(html, "js_cookie").unwrap(), "remembered-proof");
        assert!(input_value(html, "other").is_none());
    }
}
