//! The stateful scrape engine: balance fetch and the paginated transaction
//! search.
//!
//! Transaction retrieval is a sequence of partial postbacks against a
//! server-rendered form. The server rejects stale state, so every postback
//! carries the freshest hidden-field tokens returned by the previous delta
//! response — never the original page's values.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use reqwest::header::{COOKIE, HeaderValue};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::CookieSet;
use crate::http::{build_plain_client, looks_like_login_url};
use crate::markup::{field_value, hidden_fields, input_value, selected_option};
use crate::sso::SessionRefresher;

use super::dates::{client_state, to_wire_datetime};
use super::delta::{self, DeltaPart};
use super::{BalanceRecord, ScrapeError, TransactionRecord};

const SUMMARY_PAGE: &str = "AccountSummary.aspx";
const TRANSACTION_PAGE: &str = "AccountTransaction.aspx";

/// `__EVENTTARGET` of the search form's submit button.
const SEARCH_EVENT_TARGET: &str = "ctl00$MainContent$ContinueButton";

static DATE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,2}/\d{1,2}/\d{4}").unwrap_or_else(|e| panic!("invalid date regex: {e}"))
});
static POSTBACK_TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__doPostBack\('([^']+)'")
        .unwrap_or_else(|e| panic!("invalid postback regex: {e}"))
});

/// Compiles a known-good CSS selector; panics on invalid pattern.
fn selector(pattern: &str) -> Selector {
    Selector::parse(pattern).unwrap_or_else(|e| panic!("invalid selector '{pattern}': {e}"))
}

/// The exclusively-owned session state threaded through every scrape
/// operation.
///
/// Persisting either set to storage is a side effect the owning caller
/// performs after the operation, never this engine.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Cookies scoped to the scraped application.
    pub target: CookieSet,
    /// Federation-wide cookies used for silent refresh.
    pub federation: CookieSet,
}

/// Hidden form state resubmitted with every partial postback.
///
/// Ephemeral and sequential: tokens from each delta response must fully
/// replace the previous ones before the next postback or the server rejects
/// the request as stale.
#[derive(Debug, Clone)]
struct PostbackState {
    fields: Vec<(String, String)>,
}

impl PostbackState {
    fn new() -> Self {
        Self { fields: Vec::new() }
    }

    fn push(&mut self, name: &str, value: impl Into<String>) {
        self.fields.push((name.to_string(), value.into()));
    }

    fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.fields.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }

    fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    fn get(&self, name: &str) -> Option<&str> {
        field_value(&self.fields, name)
    }

    /// Replaces existing fields with the refreshed tokens from a delta
    /// response; `__ncforminfo` is inserted even when absent from the form.
    fn apply_updates(&mut self, updates: &[(String, String)]) {
        for (name, value) in updates {
            if name == "__ncforminfo" {
                self.set(name, value.clone());
            } else if let Some(entry) = self.fields.iter_mut().find(|(n, _)| n == name) {
                entry.1 = value.clone();
            }
        }
    }
}

/// Client for the scraped application's pages and postbacks.
#[derive(Debug)]
pub struct ScrapeEngine {
    client: Client,
    base_url: Url,
    refresher: SessionRefresher,
}

impl ScrapeEngine {
    /// Creates an engine rooted at the application base URL (the directory
    /// containing the summary and transaction pages).
    ///
    /// # Errors
    ///
    /// Returns [`ScrapeError::Protocol`] when the URL is invalid or client
    /// construction fails.
    pub fn new(base_url: &str) -> Result<Self, ScrapeError> {
        let mut base = base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url: Url = base
            .parse()
            .map_err(|_| ScrapeError::protocol(format!("invalid base URL: {base_url}")))?;

        let summary_url = base_url
            .join(SUMMARY_PAGE)
            .map_err(|_| ScrapeError::protocol("cannot derive summary page URL"))?;
        let refresher = SessionRefresher::new(summary_url.as_str())
            .map_err(|e| ScrapeError::protocol(format!("refresher construction failed: {e}")))?;

        let client = build_plain_client()
            .map_err(|e| ScrapeError::protocol(format!("HTTP client construction failed: {e}")))?;

        Ok(Self {
            client,
            base_url,
            refresher,
        })
    }

    fn page_url(&self, page: &str) -> Result<Url, ScrapeError> {
        self.base_url
            .join(page)
            .map_err(|_| ScrapeError::protocol(format!("cannot build page URL for {page}")))
    }

    /// Fetches account balances from the summary page.
    ///
    /// # Errors
    ///
    /// Returns [`ScrapeError::SessionExpired`] when the session is gone and
    /// one silent refresh did not revive it; transport/protocol errors
    /// otherwise.
    pub async fn fetch_balances(
        &self,
        session: &mut SessionContext,
    ) -> Result<Vec<BalanceRecord>, ScrapeError> {
        let html = self.fetch_page(session, SUMMARY_PAGE).await?;
        let accounts = parse_balances(&html);
        info!(accounts = accounts.len(), "balances fetched");
        Ok(accounts)
    }

    /// Fetches transaction history, optionally bounded by display-format
    /// dates (`M/D/YYYY h:mm AM`). Both bounds must be supplied for a custom
    /// range; otherwise the page's default window applies.
    ///
    /// Partial progress is discarded on failure — there is no meaningful
    /// partial transaction list.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`ScrapeEngine::fetch_balances`], plus
    /// [`ScrapeError::Protocol`] for unparseable date input.
    pub async fn fetch_transactions(
        &self,
        session: &mut SessionContext,
        begin_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Vec<TransactionRecord>, ScrapeError> {
        let html = self.fetch_page(session, TRANSACTION_PAGE).await?;
        let url = self.page_url(TRANSACTION_PAGE)?;

        let mut form = build_search_form(&html, begin_date, end_date)?;

        info!(
            begin = form.get("ctl00$MainContent$BeginRadDateTimePicker$dateInput").unwrap_or(""),
            end = form.get("ctl00$MainContent$EndRadDateTimePicker$dateInput").unwrap_or(""),
            "submitting transaction search"
        );
        let mut parts = self.ajax_post(session, &url, form.fields()).await?;
        let mut transactions = collect_rows(&parts);
        debug!(rows = transactions.len(), "first result page");

        // Pagination: each page's postback target is discovered from the
        // freshest result markup, and each resubmission carries the tokens
        // the previous delta returned.
        let mut page_number = 2_u32;
        loop {
            let Some(result_html) = result_grid_panel(&parts) else {
                debug!("no result grid panel; pagination done");
                break;
            };
            let Some(target) = next_page_target(result_html, page_number) else {
                debug!(page = page_number, "no next-page link; pagination done");
                break;
            };

            info!(page = page_number, target = %target, "fetching next result page");
            form.apply_updates(&delta::hidden_field_updates(&parts));
            form.set("__EVENTTARGET", target.clone());
            form.set("__EVENTARGUMENT", "");
            form.set(
                "ctl00$RadScriptManager1",
                format!("ctl00$MainContent$ctl00$MainContent$ResultPanelPanel|{target}"),
            );

            parts = self.ajax_post(session, &url, form.fields()).await?;
            let page_rows = collect_rows(&parts);
            if page_rows.is_empty() {
                debug!(page = page_number, "empty result page; stopping");
                break;
            }
            transactions.extend(page_rows);
            page_number += 1;
        }

        info!(total = transactions.len(), "transactions fetched");
        Ok(transactions)
    }

    /// GETs a page, treating an embedded assertion-redirect body as an
    /// expiry signal: one silent refresh and one retry, then hard expiry.
    async fn fetch_page(
        &self,
        session: &mut SessionContext,
        page: &str,
    ) -> Result<String, ScrapeError> {
        let url = self.page_url(page)?;
        let body = self.get_once(session, &url).await?;

        if !is_saml_redirect_page(&body) {
            return Ok(body);
        }

        info!(url = %url, "assertion redirect in page body; attempting silent refresh");
        let harvest = self
            .refresher
            .refresh(&session.federation, &body)
            .await
            .map_err(|error| {
                warn!(error = %error, "silent refresh failed");
                ScrapeError::SessionExpired
            })?;
        session.target = harvest.target;
        session.federation = harvest.federation;

        let body = self.get_once(session, &url).await?;
        if is_saml_redirect_page(&body) {
            warn!(url = %url, "assertion redirect again after refresh");
            return Err(ScrapeError::SessionExpired);
        }
        Ok(body)
    }

    async fn get_once(
        &self,
        session: &mut SessionContext,
        url: &Url,
    ) -> Result<String, ScrapeError> {
        debug!(url = %url, cookies = session.target.len(), "GET page");
        let mut request = self.client.get(url.clone());
        if let Some(header) = cookie_header_value(&session.target) {
            request = request.header(COOKIE, header);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ScrapeError::network(url.to_string(), e))?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            debug!(location = %location, "page redirected");
            if looks_like_login_url(&location) {
                return Err(ScrapeError::SessionExpired);
            }
            return Err(ScrapeError::UnexpectedRedirect {
                url: url.to_string(),
                location,
            });
        }
        if !status.is_success() {
            return Err(ScrapeError::status(url.to_string(), status.as_u16()));
        }

        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::network(url.to_string(), e))?;
        session.target.record_response(url, &headers);
        Ok(body)
    }

    /// POSTs a partial-postback form and decodes the delta response.
    async fn ajax_post(
        &self,
        session: &mut SessionContext,
        url: &Url,
        fields: &[(String, String)],
    ) -> Result<Vec<DeltaPart>, ScrapeError> {
        debug!(
            url = %url,
            event_target = field_value(fields, "__EVENTTARGET").unwrap_or(""),
            view_state_len = field_value(fields, "__VIEWSTATE").map_or(0, str::len),
            "async postback"
        );

        let mut request = self
            .client
            .post(url.clone())
            .header("X-MicrosoftAjax", "Delta=true")
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(header) = cookie_header_value(&session.target) {
            request = request.header(COOKIE, header);
        }
        let response = request
            .form(fields)
            .send()
            .await
            .map_err(|e| ScrapeError::network(url.to_string(), e))?;

        let status = response.status();
        if status.is_redirection() {
            warn!(url = %url, "postback redirected; session expired");
            return Err(ScrapeError::SessionExpired);
        }

        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::network(url.to_string(), e))?;

        if !status.is_success() {
            return Err(ScrapeError::status(url.to_string(), status.as_u16()));
        }
        if body.contains("pageRedirect") {
            warn!(url = %url, "pageRedirect delta part; session expired");
            return Err(ScrapeError::SessionExpired);
        }

        session.target.record_response(url, &headers);
        Ok(delta::decode(&body))
    }
}

fn cookie_header_value(cookies: &CookieSet) -> Option<HeaderValue> {
    if cookies.is_empty() {
        return None;
    }
    HeaderValue::from_str(&cookies.cookie_header()).ok()
}

/// True when a 200 body is really an expiry signal in disguise: an
/// auto-submitting assertion form instead of the expected content.
fn is_saml_redirect_page(body: &str) -> bool {
    body.contains("document.forms") && body.to_ascii_lowercase().contains("idp")
}

fn element_text(element: scraper::ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Parses balance rows from the summary page markup.
fn parse_balances(html: &str) -> Vec<BalanceRecord> {
    let doc = Html::parse_document(html);
    let name_sel = selector(".accountName");
    let balance_sel = selector(".accountBalance span");
    let status_sel = selector(".accountStatus");
    let mut accounts = Vec::new();

    for account in doc.select(&selector(".account")) {
        let name = account
            .select(&name_sel)
            .next()
            .map(element_text)
            .unwrap_or_default();

        let balance = account
            .select(&balance_sel)
            .next()
            .map(element_text)
            .or_else(|| account.select(&status_sel).next().map(element_text));

        if let Some(balance) = balance {
            debug!(account = %name, "balance row");
            accounts.push(BalanceRecord { name, balance });
        }
    }

    accounts
}

/// Extracts transaction rows from result markup.
///
/// A row is a transaction only when its first cell matches a date pattern —
/// this filters header and pager rows without relying on structural
/// position, since the surrounding markup is irregular.
fn parse_transaction_rows(html: &str) -> Vec<TransactionRecord> {
    let doc = Html::parse_fragment(html);
    let cell_sel = selector("td");
    let mut rows = Vec::new();

    for tr in doc.select(&selector("tr")) {
        let cells: Vec<String> = tr.select(&cell_sel).map(element_text).collect();
        if cells.len() < 3 || !DATE_ROW_RE.is_match(&cells[0]) {
            continue;
        }
        if cells.len() < 6 {
            warn!(cells = cells.len(), "date-prefixed row with too few cells");
            continue;
        }
        rows.push(TransactionRecord {
            date: cells[0].clone(),
            account: cells[1].clone(),
            location: cells[3].clone(),
            kind: cells[4].clone(),
            amount: cells[5].clone(),
        });
    }

    rows
}

/// Collects transaction rows from every row-bearing update panel.
fn collect_rows(parts: &[DeltaPart]) -> Vec<TransactionRecord> {
    parts
        .iter()
        .filter(|part| part.kind == "updatePanel" && part.content.contains("<tr"))
        .flat_map(|part| parse_transaction_rows(&part.content))
        .collect()
}

/// Finds the latest update panel carrying the result grid markup.
fn result_grid_panel(parts: &[DeltaPart]) -> Option<&str> {
    parts
        .iter()
        .filter(|part| part.kind == "updatePanel" && part.content.contains("ResultRadGrid"))
        .map(|part| part.content.as_str())
        .next_back()
}

/// Scans result markup for the postback target of a page-number link.
fn next_page_target(html: &str, page_number: u32) -> Option<String> {
    let doc = Html::parse_fragment(html);
    let wanted = page_number.to_string();

    for anchor in doc.select(&selector("a[href]")) {
        if element_text(anchor) != wanted {
            continue;
        }
        let href = anchor.value().attr("href").unwrap_or_default();
        if let Some(caps) = POSTBACK_TARGET_RE.captures(href) {
            return Some(caps[1].to_string());
        }
    }
    None
}

fn picker_field_names(which: &str) -> [String; 7] {
    [
        format!("ctl00$MainContent${which}RadDateTimePicker"),
        format!("ctl00$MainContent${which}RadDateTimePicker$dateInput"),
        format!("ctl00_MainContent_{which}RadDateTimePicker_dateInput_ClientState"),
        format!("ctl00_MainContent_{which}RadDateTimePicker_calendar_SD"),
        format!("ctl00_MainContent_{which}RadDateTimePicker_calendar_AD"),
        format!("ctl00_MainContent_{which}RadDateTimePicker_ClientState"),
        format!("ctl00_MainContent_{which}RadDateTimePicker_timeView_ClientState"),
    ]
}

fn add_picker_fields(
    form: &mut PostbackState,
    hidden: &[(String, String)],
    which: &str,
    wire: &str,
    display: &str,
    state: &str,
) {
    let [value, date_input, client_state, calendar_sd, calendar_ad, picker_state, time_view] =
        picker_field_names(which);
    let hidden_or = |name: &str, default: &str| {
        field_value(hidden, name).unwrap_or(default).to_string()
    };

    form.push(&value, wire);
    form.push(&date_input, display);
    form.push(&client_state, state);
    form.push(&calendar_sd, hidden_or(&calendar_sd, "[]"));
    form.push(&calendar_ad, hidden_or(&calendar_ad, ""));
    form.push(&picker_state, hidden_or(&picker_state, ""));
    form.push(&time_view, hidden_or(&time_view, ""));
}

/// Builds the search postback form from the transaction page markup and the
/// requested date range.
fn build_search_form(
    html: &str,
    begin_date: Option<&str>,
    end_date: Option<&str>,
) -> Result<PostbackState, ScrapeError> {
    let hidden = hidden_fields(html);
    let hidden_or = |name: &str| field_value(&hidden, name).unwrap_or_default().to_string();

    let account_value = selected_option(html, "MainContent_Accounts").unwrap_or_default();
    let kind_value = selected_option(html, "MainContent_TransactionType").unwrap_or_default();
    debug!(account = %account_value, kind = %kind_value, "filter defaults");

    let page_begin = input_value(html, "ctl00$MainContent$BeginRadDateTimePicker$dateInput")
        .unwrap_or_default();
    let page_end =
        input_value(html, "ctl00$MainContent$EndRadDateTimePicker$dateInput").unwrap_or_default();

    let begin_display = begin_date.map_or(page_begin, ToString::to_string);
    let end_display = end_date.map_or(page_end, ToString::to_string);

    // A custom range needs both the wire encoding and the client-state blob
    // to match exactly, or the server ignores it and uses the default
    // window.
    let custom = begin_date.is_some() && end_date.is_some();
    let (begin_wire, end_wire, begin_state, end_state) = if custom {
        (
            to_wire_datetime(&begin_display)?,
            to_wire_datetime(&end_display)?,
            client_state(&begin_display)?,
            client_state(&end_display)?,
        )
    } else {
        (
            hidden_or("ctl00_MainContent_BeginRadDateTimePicker"),
            hidden_or("ctl00_MainContent_EndRadDateTimePicker"),
            hidden_or("ctl00_MainContent_BeginRadDateTimePicker_dateInput_ClientState"),
            hidden_or("ctl00_MainContent_EndRadDateTimePicker_dateInput_ClientState"),
        )
    };

    let mut form = PostbackState::new();
    form.push("RadScriptManager1_TSM", hidden_or("RadScriptManager1_TSM"));
    form.push("__EVENTTARGET", SEARCH_EVENT_TARGET);
    form.push("__EVENTARGUMENT", "");
    form.push("__VIEWSTATE", hidden_or("__VIEWSTATE"));
    form.push("__VIEWSTATEGENERATOR", hidden_or("__VIEWSTATEGENERATOR"));
    form.push("__SCROLLPOSITIONX", "0");
    form.push("__SCROLLPOSITIONY", "0");
    form.push("__VIEWSTATEENCRYPTED", "");
    form.push("__EVENTVALIDATION", hidden_or("__EVENTVALIDATION"));
    form.push("ctl00$MainContent$Accounts", account_value);
    form.push("ctl00$MainContent$TransactionType", kind_value);
    add_picker_fields(
        &mut form,
        &hidden,
        "Begin",
        &begin_wire,
        &begin_display,
        &begin_state,
    );
    add_picker_fields(&mut form, &hidden, "End", &end_wire, &end_display, &end_state);
    form.push("ctl00$MainContent$AmountRangeFrom", "");
    form.push(
        "ctl00_MainContent_AmountRangeFrom_ClientState",
        hidden_or("ctl00_MainContent_AmountRangeFrom_ClientState"),
    );
    form.push("ctl00$MainContent$AmountRangeTo", "");
    form.push(
        "ctl00_MainContent_AmountRangeTo_ClientState",
        hidden_or("ctl00_MainContent_AmountRangeTo_ClientState"),
    );
    form.push("ctl00$MainContent$Location", "");
    form.push(
        "ctl00$RadScriptManager1",
        format!("ctl00$MainContent$ctl00$MainContent$ActionPanelPanel|{SEARCH_EVENT_TARGET}"),
    );
    form.push("__ASYNCPOST", "true");

    if let Some(ncforminfo) = field_value(&hidden, "__ncforminfo") {
        form.push("__ncforminfo", ncforminfo);
    }

    Ok(form)
}
