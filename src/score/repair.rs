// src/score/repair.rs
//! Response repair: turns free-form AI-service text into parsed JSON.
//!
//! AI responses carry no structure guarantee. An ordered chain of extraction
//! strategies is applied, stopping at the first success:
//!   1) fenced code block
//!   2) first balanced JSON span in the raw text
//!   3) corrective transforms (trailing commas, control chars, quoting)
//!   4) best-effort completion of a truncated payload
//!
//! Strategies are tried in isolation; a failure in one never prevents the
//! next. If all fail the caller fails closed (quality: fail).

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

/// Run the full strategy chain over `raw`. Stateless and side-effect free.
pub fn repair(raw: &str) -> Result<Value> {
    let strategies: [fn(&str) -> Option<Value>; 4] = [
        extract_fenced_block,
        extract_balanced_span,
        apply_corrective_transforms,
        complete_truncated_payload,
    ];
    for strat in strategies {
        if let Some(v) = strat(raw) {
            return Ok(v);
        }
    }
    Err(anyhow!("no repair strategy produced valid JSON"))
}

/// Strategy 1: pull the body of the first fenced code block and parse it.
fn extract_fenced_block(raw: &str) -> Option<Value> {
    static RE_FENCE: OnceCell<Regex> = OnceCell::new();
    let re = RE_FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("fence regex")
    });
    let caps = re.captures(raw)?;
    serde_json::from_str(caps.get(1)?.as_str()).ok()
}

/// Strategy 2: scan for the first `{` or `[` and take the balanced span,
/// honoring string literals and escapes.
fn extract_balanced_span(raw: &str) -> Option<Value> {
    let span = balanced_span(raw)?;
    serde_json::from_str(span).ok()
}

fn balanced_span(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let start = raw.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strategy 3: apply known corrective transforms to the candidate span and
/// retry parsing. Fixes, in order: single-quoted keys/values, trailing
/// commas, raw control characters inside strings.
fn apply_corrective_transforms(raw: &str) -> Option<Value> {
    // Work on the widest plausible span: first opening brace to last closer.
    let start = raw.find(['{', '['])?;
    let end = raw.rfind(['}', ']'])?;
    if end < start {
        return None;
    }
    let mut text = raw[start..=end].to_string();

    static RE_SQ_KEY: OnceCell<Regex> = OnceCell::new();
    let re_sq_key = RE_SQ_KEY
        .get_or_init(|| Regex::new(r"'([^'\\]*)'(\s*:)").expect("single-quoted key regex"));
    text = re_sq_key.replace_all(&text, "\"$1\"$2").to_string();

    static RE_SQ_VAL: OnceCell<Regex> = OnceCell::new();
    let re_sq_val = RE_SQ_VAL
        .get_or_init(|| Regex::new(r"(:\s*)'([^'\\]*)'").expect("single-quoted value regex"));
    text = re_sq_val.replace_all(&text, "$1\"$2\"").to_string();

    static RE_TRAILING: OnceCell<Regex> = OnceCell::new();
    let re_trailing =
        RE_TRAILING.get_or_init(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex"));
    text = re_trailing.replace_all(&text, "$1").to_string();

    text = escape_control_chars(&text);

    serde_json::from_str(&text).ok()
}

/// Replace unescaped ASCII control characters inside string literals with
/// their JSON escapes.
fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    use std::fmt::Write as _;
                    let _ = write!(out, "\\u{:04x}", c as u32);
                }
                c => out.push(c),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// Strategy 4: close unterminated strings/brackets of a truncated payload
/// and retry. Only helps when the cut fell after a complete key/value pair
/// or inside a terminal string; anything else still fails to parse.
fn complete_truncated_payload(raw: &str) -> Option<Value> {
    let start = raw.find(['{', '['])?;
    let mut text = raw[start..].trim_end().to_string();

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if escaped {
        // A dangling backslash cannot be completed meaningfully.
        return None;
    }
    if in_string {
        text.push('"');
    }
    while text.ends_with(',') {
        text.pop();
    }
    while let Some(closer) = stack.pop() {
        text.push(closer);
    }

    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_block_wins_over_surrounding_prose() {
        let raw = "Sure! ```json\n{\"score\":0.8,\"pass\":true}\n``` hope that helps";
        let v = repair(raw).unwrap();
        assert_eq!(v, json!({"score": 0.8, "pass": true}));
    }

    #[test]
    fn balanced_span_is_found_inside_prose() {
        let raw = "Here you go: {\"score\": 0.4, \"pass\": false} — let me know!";
        let v = repair(raw).unwrap();
        assert_eq!(v["score"], json!(0.4));
    }

    #[test]
    fn balanced_span_ignores_braces_inside_strings() {
        let raw = r#"{"reason": "nested { brace } inside", "pass": true}"#;
        let v = repair(raw).unwrap();
        assert_eq!(v["reason"], json!("nested { brace } inside"));
    }

    #[test]
    fn trailing_commas_are_corrected() {
        let raw = r#"{"score": 0.7, "pass": true,}"#;
        let v = repair(raw).unwrap();
        assert_eq!(v["pass"], json!(true));
    }

    #[test]
    fn single_quoted_keys_are_corrected() {
        let raw = "{'score': 0.9, 'pass': true}";
        let v = repair(raw).unwrap();
        assert_eq!(v["score"], json!(0.9));
    }

    #[test]
    fn raw_newline_inside_string_is_escaped() {
        let raw = "{\"reason\": \"line one\nline two\", \"pass\": true}";
        let v = repair(raw).unwrap();
        assert_eq!(v["reason"], json!("line one\nline two"));
    }

    #[test]
    fn truncated_array_is_completed() {
        let raw = r#"{"tags": ["a", "b""#;
        let v = repair(raw).unwrap();
        assert_eq!(v["tags"], json!(["a", "b"]));
    }

    #[test]
    fn truncation_inside_key_fails_every_strategy() {
        // Cut mid-key: completion yields a key without a value, still invalid.
        let raw = r#"{"score":0.8,"pas"#;
        assert!(repair(raw).is_err());
    }

    #[test]
    fn prose_without_payload_fails() {
        assert!(repair("I cannot answer that.").is_err());
    }

    #[test]
    fn repair_is_idempotent_on_its_own_output() {
        let raw = "noise {\"score\": 0.66, \"pass\": true, \"reason\": \"ok\"} noise";
        let first = repair(raw).unwrap();
        let reserialized = serde_json::to_string(&first).unwrap();
        let second = repair(&reserialized).unwrap();
        assert_eq!(first, second);
    }
}
