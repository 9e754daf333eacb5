//! Date conversions for the transaction search form.
//!
//! The search form displays dates in a locale format (`M/D/YYYY h:mm AM`)
//! but the rendering control round-trips two other representations: a wire
//! encoding (`YYYY-MM-DD-HH-MM-SS`) and a JSON client-state blob embedding
//! that same encoding. All three must agree or the server silently ignores
//! the custom range and falls back to its default window.

use chrono::NaiveDateTime;
use serde::Serialize;

use super::ScrapeError;

/// Locale format of date inputs as displayed and accepted by callers.
pub const DISPLAY_FORMAT: &str = "%m/%d/%Y %I:%M %p";

const WIRE_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const MIN_DATE: &str = "1980-01-01-00-00-00";
const MAX_DATE: &str = "2099-12-30-00-00-00";

/// Client-state blob the date-input control posts alongside its value.
///
/// Field order matches the control's own serialization.
#[derive(Debug, Serialize)]
struct ClientState<'a> {
    enabled: bool,
    #[serde(rename = "emptyMessage")]
    empty_message: &'a str,
    #[serde(rename = "validationText")]
    validation_text: &'a str,
    #[serde(rename = "valueAsString")]
    value_as_string: &'a str,
    #[serde(rename = "minDateStr")]
    min_date_str: &'a str,
    #[serde(rename = "maxDateStr")]
    max_date_str: &'a str,
    #[serde(rename = "lastSetTextBoxValue")]
    last_set_text_box_value: &'a str,
}

fn parse_display(display: &str) -> Result<NaiveDateTime, ScrapeError> {
    NaiveDateTime::parse_from_str(display, DISPLAY_FORMAT).map_err(|e| {
        ScrapeError::protocol(format!(
            "invalid date input '{display}' (expected M/D/YYYY h:mm AM): {e}"
        ))
    })
}

/// Converts a display date to the wire encoding.
///
/// # Errors
///
/// Returns [`ScrapeError::Protocol`] when the input does not match the
/// display format.
pub fn to_wire_datetime(display: &str) -> Result<String, ScrapeError> {
    Ok(parse_display(display)?.format(WIRE_FORMAT).to_string())
}

/// Builds the date-input client-state JSON for a display date.
///
/// The wire encoding is embedded as both `validationText` and
/// `valueAsString`; the raw display text rides along as
/// `lastSetTextBoxValue`.
///
/// # Errors
///
/// Returns [`ScrapeError::Protocol`] when the input does not match the
/// display format.
pub fn client_state(display: &str) -> Result<String, ScrapeError> {
    let wire = to_wire_datetime(display)?;
    let state = ClientState {
        enabled: true,
        empty_message: "",
        validation_text: &wire,
        value_as_string: &wire,
        min_date_str: MIN_DATE,
        max_date_str: MAX_DATE,
        last_set_text_box_value: display,
    };
    serde_json::to_string(&state)
        .map_err(|e| ScrapeError::protocol(format!("client state serialization failed: {e}")))
}
