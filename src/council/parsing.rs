//! Tolerant extraction of JSON from model responses.
//!
//! Models wrap JSON in markdown fences, preamble prose, or emit
//! several adjacent objects where the contract asks for an array. The
//! two-phase approach here: strip fences, then walk the text with a
//! balanced-brace scanner that respects string literals and escapes.
//! Strict schema checks happen later in the validator.

use serde_json::Value;

/// Remove markdown code fences, keeping their contents. A fence line
/// that carries JSON on the same line is kept; the scanner ignores the
/// backticks.
pub fn strip_code_fences(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for line in raw.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") && !trimmed.contains('{') && !trimmed.contains('[') {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// All top-level balanced `{...}` spans, in order of appearance.
pub fn extract_json_objects(raw: &str) -> Vec<String> {
    let text = strip_code_fences(raw);
    let bytes = text.as_bytes();
    let mut out = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_span(&text[i..], b'{', b'}') {
                out.push(text[i..i + end].to_string());
                i += end;
                continue;
            }
            // Unbalanced tail; nothing more to find.
            break;
        }
        i += 1;
    }
    out
}

/// The first balanced JSON object in the response, if any.
pub fn extract_first_object(raw: &str) -> Option<String> {
    extract_json_objects(raw).into_iter().next()
}

/// Byte length of the balanced span starting at `text[0]` (which must
/// be `open`), string-literal aware. None if the span never closes.
fn balanced_span(text: &str, open: u8, close: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes[0], open);

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Result of extracting a reviewer response that should be a JSON
/// array of review objects.
#[derive(Debug, Clone)]
pub struct ExtractedList {
    pub values: Vec<Value>,
    /// True when the response was a bare object where the contract
    /// asks for an array (accepted, but off-contract).
    pub degraded_shape: bool,
}

/// Accepts: a JSON array of objects, a single bare object (degraded),
/// or a run of adjacent objects scanned greedily.
pub fn extract_object_list(raw: &str) -> ExtractedList {
    let text = strip_code_fences(raw);

    // Array contract first: the first top-level structural character
    // decides which shape we are looking at.
    let first_obj = text.find('{');
    let first_arr = text.find('[');
    if let Some(ai) = first_arr {
        if first_obj.map_or(true, |oi| ai < oi) {
            if let Some(end) = balanced_span(&text[ai..], b'[', b']') {
                if let Ok(Value::Array(items)) = serde_json::from_str(&text[ai..ai + end]) {
                    let values: Vec<Value> =
                        items.into_iter().filter(|v| v.is_object()).collect();
                    return ExtractedList {
                        values,
                        degraded_shape: false,
                    };
                }
            }
        }
    }

    let objects: Vec<Value> = extract_json_objects(&text)
        .iter()
        .filter_map(|s| serde_json::from_str(s).ok())
        .collect();
    let degraded_shape = objects.len() == 1;
    ExtractedList {
        values: objects,
        degraded_shape,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_object_from_fenced_response() {
        let raw = "Here is my pitch:\n```json\n{\"instrument\": \"SPY\", \"direction\": \"LONG\"}\n```\nGood luck!";
        let obj = extract_first_object(raw).unwrap();
        let v: Value = serde_json::from_str(&obj).unwrap();
        assert_eq!(v["instrument"], "SPY");
    }

    #[test]
    fn braces_inside_strings_do_not_terminate_the_span() {
        let raw = r#"{"note": "watch the {spread} carefully", "x": 1}"#;
        let obj = extract_first_object(raw).unwrap();
        let v: Value = serde_json::from_str(&obj).unwrap();
        assert_eq!(v["x"], 1);
    }

    #[test]
    fn escaped_quotes_are_handled() {
        let raw = r#"prefix {"quote": "he said \"buy\" loudly"} suffix"#;
        let obj = extract_first_object(raw).unwrap();
        let v: Value = serde_json::from_str(&obj).unwrap();
        assert!(v["quote"].as_str().unwrap().contains("buy"));
    }

    #[test]
    fn adjacent_objects_are_scanned_greedily() {
        let raw = r#"{"target_label": "Pitch A"} {"target_label": "Pitch B"}
                     {"target_label": "Pitch C"}"#;
        let list = extract_object_list(raw);
        assert_eq!(list.values.len(), 3);
        assert!(!list.degraded_shape);
    }

    #[test]
    fn array_response_is_the_happy_path() {
        let raw = r#"[{"target_label": "Pitch A"}, {"target_label": "Pitch B"}]"#;
        let list = extract_object_list(raw);
        assert_eq!(list.values.len(), 2);
        assert!(!list.degraded_shape);
    }

    #[test]
    fn fenced_array_is_accepted() {
        let raw = "```json\n[{\"target_label\": \"Pitch A\"}]\n```";
        let list = extract_object_list(raw);
        assert_eq!(list.values.len(), 1);
        assert!(!list.degraded_shape);
    }

    #[test]
    fn single_bare_object_is_degraded() {
        let raw = r#"{"target_label": "Pitch A", "scores": {"clarity": 8}}"#;
        let list = extract_object_list(raw);
        assert_eq!(list.values.len(), 1);
        assert!(list.degraded_shape);
    }

    #[test]
    fn nested_array_inside_object_stays_object_shaped() {
        let raw = r#"{"thesis_bullets": ["a", "b"], "conviction": 1.5}"#;
        let list = extract_object_list(raw);
        assert_eq!(list.values.len(), 1);
        assert!(list.degraded_shape);
    }

    #[test]
    fn json_on_the_fence_line_survives() {
        let raw = "```json {\"score\": 0.2} ```";
        let obj = extract_first_object(raw).unwrap();
        let v: Value = serde_json::from_str(&obj).unwrap();
        assert_eq!(v["score"], 0.2);
    }

    #[test]
    fn unbalanced_response_yields_nothing() {
        assert!(extract_first_object("{\"oops\": ").is_none());
        assert!(extract_object_list("no json here").values.is_empty());
    }

    #[test]
    fn prose_before_array_is_tolerated() {
        let raw = "Reviews below.\n[{\"target_label\": \"Pitch B\"}, {\"target_label\": \"Pitch C\"}]";
        let list = extract_object_list(raw);
        assert_eq!(list.values.len(), 2);
    }
}
