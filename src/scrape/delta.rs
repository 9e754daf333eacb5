//! Codec for the partial-postback delta response format.
//!
//! A delta response is a concatenation of parts, each encoded as
//! `length|type|id|content|` where `length` is a decimal **character** count
//! of `content`. The transport is UTF-8, so the decoder must index by
//! characters — a byte-slice implementation mis-splits content containing
//! accented text.
//!
//! Decoding stops gracefully on any malformed separator and returns the
//! parts decoded so far; trailing parts are sometimes diagnostic noise and
//! must not fail the whole response.

use tracing::debug;

/// One decoded part of a delta response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPart {
    /// Part type, e.g. `updatePanel` or `hiddenField`.
    pub kind: String,
    /// Part id; for hidden-field parts this is the field name.
    pub id: String,
    /// Part payload, exactly `length` characters.
    pub content: String,
}

impl DeltaPart {
    /// Creates a part.
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            content: content.into(),
        }
    }
}

fn find_pipe(chars: &[char], from: usize) -> Option<usize> {
    chars[from..].iter().position(|&c| c == '|').map(|i| from + i)
}

fn segment(chars: &[char], range: std::ops::Range<usize>) -> String {
    chars[range].iter().collect()
}

/// Decodes a delta response into its parts.
///
/// Malformed separators or a non-numeric length field end decoding; the
/// parts decoded up to that point are returned. Content shorter than its
/// declared length (a truncated tail) is kept as-is, matching how the
/// rendering control behaves.
#[must_use]
pub fn decode(text: &str) -> Vec<DeltaPart> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let Some(pipe1) = find_pipe(&chars, pos) else {
            break;
        };
        let Ok(length) = segment(&chars, pos..pipe1).parse::<usize>() else {
            break;
        };
        pos = pipe1 + 1;

        let Some(pipe2) = find_pipe(&chars, pos) else {
            break;
        };
        let kind = segment(&chars, pos..pipe2);
        pos = pipe2 + 1;

        let Some(pipe3) = find_pipe(&chars, pos) else {
            break;
        };
        let id = segment(&chars, pos..pipe3);
        pos = pipe3 + 1;

        let content_end = (pos + length).min(chars.len());
        let content = segment(&chars, pos..content_end);
        pos = pos + length + 1;

        parts.push(DeltaPart { kind, id, content });
    }

    debug!(parts = parts.len(), "decoded delta response");
    parts
}

/// Encodes parts back into the wire format.
///
/// For any well-formed response, `encode(&decode(text))` reproduces `text`
/// exactly.
#[must_use]
pub fn encode(parts: &[DeltaPart]) -> String {
    parts
        .iter()
        .map(|part| {
            format!(
                "{}|{}|{}|{}|",
                part.content.chars().count(),
                part.kind,
                part.id,
                part.content
            )
        })
        .collect()
}

/// Extracts refreshed hidden-field tokens from a decoded response, keyed by
/// part id.
///
/// These supersede the prior page's tokens for every subsequent postback.
#[must_use]
pub fn hidden_field_updates(parts: &[DeltaPart]) -> Vec<(String, String)> {
    parts
        .iter()
        .filter(|part| part.kind == "hiddenField")
        .map(|part| (part.id.clone(), part.content.clone()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_part() {
        let parts = decode("5|updatePanel|Panel1|hello|");
        assert_eq!(parts, vec![DeltaPart::new("updatePanel", "Panel1", "hello")]);
    }

    #[test]
    fn test_decode_multiple_parts() {
        let text = "3|hiddenField|__VIEWSTATE|abc|4|hiddenField|__EVENTVALIDATION|defg|";
        let parts = decode(text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id, "__VIEWSTATE");
        assert_eq!(parts[0].content, "abc");
        assert_eq!(parts[1].content, "defg");
    }

    #[test]
    fn test_decode_content_containing_pipes() {
        // The length prefix, not pipe scanning, delimits content.
        let parts = decode("7|updatePanel|P|a|b|c|d|");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, "a|b|c|d");
    }

    #[test]
    fn test_round_trip_law() {
        let text = "5|updatePanel|Panel1|<tr/>|12|hiddenField|__VIEWSTATE|dDwtMTIzNDU2|0|asyncPostBackControlIDs|||";
        assert_eq!(encode(&decode(text)), text);
    }

    #[test]
    fn test_decode_counts_characters_not_bytes() {
        // "café" is 4 characters, 5 bytes in UTF-8.
        let text = "4|updatePanel|P|café|6|updatePanel|Q|next··|";
        let parts = decode(text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content, "café");
        assert_eq!(parts[1].content, "next··");
        assert_eq!(encode(&parts), text);
    }

    #[test]
    fn test_decode_truncated_length_returns_prior_parts() {
        let text = "3|hiddenField|A|abc|xx|broken";
        let parts = decode(text);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, "abc");
    }

    #[test]
    fn test_decode_missing_separator_returns_prior_parts() {
        let text = "3|hiddenField|A|abc|5|updatePanel";
        let parts = decode(text);
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn test_decode_truncated_content_keeps_partial_tail() {
        let parts = decode("10|updatePanel|P|short");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, "short");
    }

    #[test]
    fn test_decode_empty_and_garbage() {
        assert!(decode("").is_empty());
        assert!(decode("no pipes here").is_empty());
        assert!(decode("|||").is_empty());
    }

    #[test]
    fn test_hidden_field_updates_filters_by_kind() {
        let parts = vec![
            DeltaPart::new("updatePanel", "Panel1", "<tr/>"),
            DeltaPart::new("hiddenField", "__VIEWSTATE", "vs2"),
            DeltaPart::new("hiddenField", "__EVENTVALIDATION", "ev2"),
        ];
        let updates = hidden_field_updates(&parts);
        assert_eq!(
            updates,
            vec![
                ("__VIEWSTATE".to_string(), "vs2".to_string()),
                ("__EVENTVALIDATION".to_string(), "ev2".to_string()),
            ]
        );
    }
}
