//! Shared page fixtures for the integration suites.
//!
//! Builders produce the markup shapes the real identity provider,
//! second-factor provider, and scraped application render, parameterized on
//! mock-server URIs.

// Not every suite uses every fixture.
#![allow(dead_code)]

/// Identity-provider login page with the standard `fm1` form.
#[must_use]
pub fn login_page(action: &str) -> String {
    format!(
        r#"<html><head><title>Login</title></head><body>
        <form id="fm1" action="{action}" method="post">
          <input type="hidden" name="execution" value="e1s1"/>
          <input type="hidden" name="_eventId" value="submit"/>
          <input type="text" name="username"/>
          <input type="password" name="password"/>
        </form>
        </body></html>"#
    )
}

/// Post-credential page carrying iframe-style challenge parameters in a
/// script literal.
#[must_use]
pub fn duo_iframe_page(duo_host: &str, post_action: &str) -> String {
    format!(
        r#"<html><head><title>Two-factor</title></head><body>
        <iframe id="duo_iframe"></iframe>
        <script>
          Duo.init({{
            'host': '{duo_host}',
            'sig_request': 'TX|tx-token|sig:APP|app-token|sig2',
            'post_action': '{post_action}'
          }});
        </script>
        </body></html>"#
    )
}

/// Universal-prompt page with the preliminary device-fingerprint form and
/// embedded base-data JSON.
#[must_use]
pub fn duo_universal_page(xsrf: &str) -> String {
    format!(
        r#"<html><head><title>Prompt</title></head><body>
        <form id="plugin_form" method="post">
          <input type="hidden" name="tx" value="jwt-blob"/>
          <input type="hidden" name="_xsrf" value="{xsrf}"/>
        </form>
        </body></html>"#
    )
}

/// Healthcheck page returned after the fingerprint form, carrying the
/// authoritative anti-forgery token.
#[must_use]
pub fn duo_healthcheck_page(xsrf: &str) -> String {
    format!(
        r#"<html><body>
        <script id="base-data" type="application/json">{{"xsrf_token": "{xsrf}"}}</script>
        <div id="react-root"></div>
        </body></html>"#
    )
}

/// SAML assertion auto-submit page (IdP → service provider).
#[must_use]
pub fn assertion_page(action: &str) -> String {
    format!(
        r#"<html><body onload="document.forms[0].submit()">
        <form action="{action}" method="post">
          <input type="hidden" name="SAMLResponse" value="assertion-blob"/>
          <input type="hidden" name="RelayState" value="rs"/>
        </form>
        </body></html>"#
    )
}

/// SP-initiated SAML request page: what the application serves (with a 200)
/// when its session is gone. The auto-submit script plus the IdP action mark
/// it as an expiry signal in disguise.
#[must_use]
pub fn saml_request_page(idp_action: &str) -> String {
    format!(
        r#"<html><head><title>Working...</title></head><body>
        <form name="theform" action="{idp_action}" method="post">
          <input type="hidden" name="SAMLRequest" value="request-blob"/>
          <input type="hidden" name="RelayState" value="rs"/>
        </form>
        <script>document.forms.theform.submit()</script>
        </body></html>"#
    )
}

/// Account-summary page with the given name/balance rows.
#[must_use]
pub fn summary_page(accounts: &[(&str, &str)]) -> String {
    let rows: String = accounts
        .iter()
        .map(|(name, balance)| {
            format!(
                r#"<div class="account">
                  <div class="accountName">{name}</div>
                  <div class="accountBalance"><span>{balance}</span></div>
                </div>"#
            )
        })
        .collect();
    format!(
        r#"<html><head><title>Account Summary</title></head><body>{rows}</body></html>"#
    )
}

/// Account-summary page padded past the stub-page size threshold, for
/// already-authenticated detection.
#[must_use]
pub fn padded_summary_page(accounts: &[(&str, &str)]) -> String {
    let mut page = summary_page(accounts);
    page.push_str(&"<!-- padding -->".repeat(400));
    page
}

/// Transaction search page with hidden state, filter dropdowns, and date
/// inputs.
#[must_use]
pub fn transaction_page() -> String {
    r#"<html><head><title>Account Transactions</title></head><body>
    <form method="post" action="./AccountTransaction.aspx">
      <input type="hidden" name="RadScriptManager1_TSM" value="tsm-blob"/>
      <input type="hidden" name="__VIEWSTATE" value="page-vs"/>
      <input type="hidden" name="__VIEWSTATEGENERATOR" value="gen-1"/>
      <input type="hidden" name="__EVENTVALIDATION" value="page-ev"/>
      <input type="hidden" name="__ncforminfo" value="nc-page"/>
      <input type="hidden" name="ctl00_MainContent_BeginRadDateTimePicker" value="2026-01-01-00-00-00"/>
      <input type="hidden" name="ctl00_MainContent_EndRadDateTimePicker" value="2026-01-31-00-00-00"/>
      <select id="MainContent_Accounts" name="ctl00$MainContent$Accounts">
        <option value="acct-all" selected>All Accounts</option>
      </select>
      <select id="MainContent_TransactionType" name="ctl00$MainContent$TransactionType">
        <option value="type-all" selected>All Types</option>
      </select>
      <input name="ctl00$MainContent$BeginRadDateTimePicker$dateInput" value="1/1/2026 12:00 AM"/>
      <input name="ctl00$MainContent$EndRadDateTimePicker$dateInput" value="1/31/2026 12:00 AM"/>
    </form>
    </body></html>"#
        .to_string()
}

/// A result-grid table fragment with the given transaction rows and pager
/// links up to `last_page`.
#[must_use]
pub fn result_grid(rows: &[(&str, &str, &str, &str, &str)], next_page: Option<u32>) -> String {
    let body: String = rows
        .iter()
        .map(|(date, account, location, kind, amount)| {
            format!(
                "<tr><td>{date}</td><td>{account}</td><td>xxxx</td><td>{location}</td><td>{kind}</td><td>{amount}</td></tr>"
            )
        })
        .collect();
    let pager = next_page.map_or_else(String::new, |page| {
        format!(
            r#"<a href="javascript:__doPostBack('ctl00$MainContent$ResultRadGrid$page{page}','')">{page}</a>"#
        )
    });
    format!(
        r#"<div id="MainContent_ResultRadGrid"><table>
        <tr><td>Date</td><td>Account</td><td>Card</td><td>Location</td><td>Type</td><td>Amount</td></tr>
        {body}
        </table>{pager}</div>"#
    )
}
