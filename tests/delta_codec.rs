//! Integration tests for the delta codec through the public API.

use cardwatch_core::scrape::delta::{DeltaPart, decode, encode, hidden_field_updates};

#[test]
fn test_well_formed_response_round_trips_exactly() {
    let parts = vec![
        DeltaPart::new("updatePanel", "MainContent_ResultPanelPanel", "<div><tr><td>1</td></tr></div>"),
        DeltaPart::new("hiddenField", "__VIEWSTATE", "dDwtMTIzNDU2Nzg5"),
        DeltaPart::new("hiddenField", "__EVENTVALIDATION", "wEWAgL+"),
        DeltaPart::new("scriptBlock", "ScriptPath", "/ScriptResource.axd?d=abc"),
    ];
    let wire = encode(&parts);
    assert_eq!(decode(&wire), parts);
    assert_eq!(encode(&decode(&wire)), wire);
}

#[test]
fn test_non_ascii_content_splits_on_characters() {
    // Accented location names must not shift part boundaries.
    let parts = vec![
        DeltaPart::new("updatePanel", "P", "Café Münchën — crêpes"),
        DeltaPart::new("hiddenField", "__VIEWSTATE", "vs"),
    ];
    let wire = encode(&parts);
    let decoded = decode(&wire);
    assert_eq!(decoded, parts);
    assert_eq!(decoded[0].content, "Café Münchën — crêpes");
    assert_eq!(decoded[1].content, "vs");
}

#[test]
fn test_truncated_length_field_never_panics() {
    let wire = "11|updatePanel|P|hello world|4x|oops|trailing";
    let parts = decode(wire);
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].content, "hello world");
}

#[test]
fn test_hidden_field_updates_supersede_tokens() {
    let wire = encode(&[
        DeltaPart::new("updatePanel", "P", "<tr/>"),
        DeltaPart::new("hiddenField", "__VIEWSTATE", "fresh-vs"),
    ]);
    let updates = hidden_field_updates(&decode(&wire));
    assert_eq!(
        updates,
        vec![("__VIEWSTATE".to_string(), "fresh-vs".to_string())]
    );
}
