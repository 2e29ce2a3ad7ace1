//! Detection, extraction and textual repair of JSON in model output.
//!
//! Every function here is pure. [`repair_json`] applies its heuristics
//! once each, in a fixed order:
//!
//! 1. locate the structured region (fenced block, balanced region, or the
//!    tail starting at the first opener)
//! 2. normalize single-quoted strings to double quotes
//! 3. quote bare identifier keys
//! 4. strip trailing commas
//! 5. close unterminated strings and append missing closers
//! 6. reserialize, which keeps the last of any duplicate keys
//!
//! When the result still does not parse, the trimmed input is returned
//! unchanged, which keeps the function idempotent.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Error marker for empty model output.
pub const EMPTY_RESPONSE: &str = "empty_response";

/// Error marker for structured output that could not be recovered.
pub const JSON_PARSING_FAILED: &str = "json_parsing_failed";

static FENCE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z]*[ \t]*\r?\n?([\s\S]*?)```").ok());

/// Returns true if `text` parses as JSON.
#[must_use]
pub fn is_valid_json(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok()
}

fn starts_structured(text: &str) -> bool {
    text.starts_with('{') || text.starts_with('[')
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    FENCE_PATTERN.as_ref().map_or_else(Vec::new, |pattern| {
        pattern
            .captures_iter(text)
            .filter_map(|captures| captures.get(1))
            .map(|block| block.as_str().trim())
            .collect()
    })
}

/// Returns the end (exclusive) of the balanced region opening at `start`.
///
/// Delimiters are ASCII, so byte offsets are always char boundaries.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(byte) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Top-level balanced regions, in order of appearance.
fn balanced_regions(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut regions = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        if matches!(bytes[index], b'{' | b'[') {
            if let Some(end) = balanced_end(bytes, index) {
                regions.push(&text[index..end]);
                index = end;
                continue;
            }
        }
        index += 1;
    }
    regions
}

/// Finds JSON embedded in surrounding prose.
///
/// Fenced code blocks are preferred. Otherwise the first valid top-level
/// balanced region wins, then the first balanced region even if invalid.
#[must_use]
pub fn extract_json(text: &str) -> Option<String> {
    if let Some(block) = fenced_blocks(text)
        .into_iter()
        .find(|block| starts_structured(block) && is_valid_json(block))
    {
        return Some(block.to_string());
    }

    let regions = balanced_regions(text);
    regions
        .iter()
        .find(|region| is_valid_json(region))
        .or_else(|| regions.first())
        .map(|region| (*region).to_string())
}

fn locate_structure(text: &str) -> &str {
    if let Some(block) = fenced_blocks(text)
        .into_iter()
        .find(|block| starts_structured(block))
    {
        return block;
    }
    if let Some(region) = balanced_regions(text).into_iter().next() {
        return region;
    }
    text.find(['{', '[']).map_or(text, |start| &text[start..])
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Double,
    Single,
}

fn normalize_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    let mut state = Quote::None;

    while let Some(c) = chars.next() {
        match state {
            Quote::None => match c {
                '"' => {
                    state = Quote::Double;
                    out.push(c);
                }
                '\'' => {
                    state = Quote::Single;
                    out.push('"');
                }
                _ => out.push(c),
            },
            Quote::Double => {
                out.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == '"' {
                    state = Quote::None;
                }
            }
            Quote::Single => match c {
                '\\' => match chars.next() {
                    Some('\'') => out.push('\''),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push_str("\\\\"),
                },
                '"' => out.push_str("\\\""),
                '\'' => {
                    out.push('"');
                    state = Quote::None;
                }
                _ => out.push(c),
            },
        }
    }
    out
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '-')
}

fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if expect_key && is_ident_start(c) {
            let mut end = i;
            while end < chars.len() && is_ident_char(chars[end]) {
                end += 1;
            }
            let mut next = end;
            while next < chars.len() && chars[next].is_whitespace() {
                next += 1;
            }
            if chars.get(next) == Some(&':') {
                out.push('"');
                out.extend(&chars[i..end]);
                out.push('"');
                expect_key = false;
                i = end;
                continue;
            }
        }

        match c {
            '"' => {
                in_string = true;
                expect_key = false;
            }
            '{' | ',' => expect_key = true,
            c if c.is_whitespace() => {}
            _ => expect_key = false,
        }
        out.push(c);
        i += 1;
    }
    out
}

fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, None | Some('}' | ']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn balance(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                // Close anything left open inside; drop closers that match nothing.
                if stack.contains(&c) {
                    while let Some(closer) = stack.pop() {
                        out.push(closer);
                        if closer == c {
                            break;
                        }
                    }
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.push('\\');
        }
        out.push('"');
    }
    if !stack.is_empty() {
        out.truncate(out.trim_end().len());
        if out.ends_with(':') {
            out.push_str(" null");
        } else if out.ends_with(',') {
            out.pop();
        }
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Applies the fixed repair heuristics to `text`.
///
/// Returns canonical JSON when repair succeeds, otherwise the trimmed input.
#[must_use]
pub fn repair_json(text: &str) -> String {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value.to_string();
    }

    let candidate = locate_structure(trimmed);
    let repaired = balance(&strip_trailing_commas(&quote_bare_keys(&normalize_quotes(
        candidate,
    ))));

    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => value.to_string(),
        Err(err) => {
            tracing::debug!(error = %err, "JSON repair did not produce parsable output");
            trimmed.to_string()
        }
    }
}

fn structured(value: Value) -> Option<Value> {
    (value.is_object() || value.is_array()).then_some(value)
}

/// Parses an object or array out of `text`, repairing it if needed.
///
/// Scalars are not considered structured and yield `None`.
#[must_use]
pub fn try_parse(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return structured(value);
    }

    let extracted = extract_json(trimmed);
    if let Some(value) = extracted
        .as_deref()
        .and_then(|region| serde_json::from_str::<Value>(region).ok())
        .and_then(structured)
    {
        return Some(value);
    }

    let repaired = repair_json(extracted.as_deref().unwrap_or(trimmed));
    serde_json::from_str::<Value>(&repaired)
        .ok()
        .and_then(structured)
}

fn looks_structured(text: &str) -> bool {
    starts_structured(text) || text.contains("```")
}

/// Parses model output into a structured value. Never fails.
///
/// Prose and scalars are wrapped as `{"response": text}`; output that
/// looked structured but could not be recovered also carries
/// `"error": "json_parsing_failed"`.
#[must_use]
pub fn parse(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return wrap_text_as_json(trimmed);
    }
    if let Some(value) = try_parse(trimmed) {
        return value;
    }
    if looks_structured(trimmed) {
        tracing::warn!("Structured output could not be repaired, wrapping as text");
        return json!({ "response": trimmed, "error": JSON_PARSING_FAILED });
    }
    wrap_text_as_json(trimmed)
}

/// Wraps plain text as `{"response": text}`.
#[must_use]
pub fn wrap_text_as_json(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return json!({ "response": "", "error": EMPTY_RESPONSE });
    }
    json!({ "response": trimmed })
}

/// Returns true if a wrapped response is usable.
///
/// The value must carry `response` and no `error`. String responses must be
/// at least `min_length` characters once trimmed.
#[must_use]
pub fn is_quality_response(value: &Value, min_length: usize) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    if object.contains_key("error") {
        return false;
    }
    match object.get("response") {
        Some(Value::String(text)) => text.trim().chars().count() >= min_length,
        Some(_) => true,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_is_valid_json() {
        assert!(is_valid_json(r#"{"a": 1}"#));
        assert!(is_valid_json("[1, 2]"));
        assert!(!is_valid_json("{'a': 1}"));
        assert!(!is_valid_json(""));
    }

    #[test]
    fn test_extract_prefers_fenced_block() {
        let text = "Sure!\n```json\n{\"a\": 1}\n```\nAlso {\"b\": 2}";
        assert_eq!(extract_json(text).as_deref(), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn test_extract_naked_region_with_prose() {
        let text = r#"Here is the result: {"score": 7, "tags": ["x"]} hope it helps"#;
        assert_eq!(
            extract_json(text).as_deref(),
            Some(r#"{"score": 7, "tags": ["x"]}"#)
        );
    }

    #[test]
    fn test_extract_skips_braces_in_strings() {
        let text = r#"result {"text": "a } b", "n": 1} done"#;
        assert_eq!(
            extract_json(text).as_deref(),
            Some(r#"{"text": "a } b", "n": 1}"#)
        );
    }

    #[test]
    fn test_extract_returns_outer_invalid_region() {
        assert_eq!(
            extract_json("x {'a': [1, 2]} y").as_deref(),
            Some("{'a': [1, 2]}")
        );
        assert_eq!(extract_json("no structure here"), None);
    }

    #[test]
    fn test_repair_single_quotes_and_trailing_comma() {
        assert_eq!(repair_json("{'a': 1,}"), r#"{"a":1}"#);
        assert_eq!(repair_json(r#"{'msg': 'say "hi"'}"#), r#"{"msg":"say \"hi\""}"#);
    }

    #[test]
    fn test_repair_bare_keys() {
        assert_eq!(
            repair_json("{name: \"pasture\", version: 2}"),
            r#"{"name":"pasture","version":2}"#
        );
    }

    #[test]
    fn test_repair_balances_truncated_output() {
        assert_eq!(
            repair_json(r#"{"items": [1, 2, {"x": "unterminated"#),
            r#"{"items":[1,2,{"x":"unterminated"}]}"#
        );
        assert_eq!(repair_json(r#"{"a": 1, "b":"#), r#"{"a":1,"b":null}"#);
        assert_eq!(repair_json(r#"{"a": [1, 2}"#), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_repair_keeps_last_duplicate_key() {
        assert_eq!(repair_json(r#"{"a": 1, "a": 2,}"#), r#"{"a":2}"#);
    }

    #[test]
    fn test_repair_strips_fence() {
        assert_eq!(repair_json("```json\n{'ok': true,}\n```"), r#"{"ok":true}"#);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let inputs = [
            "{'a': 1,}",
            "not json at all",
            r#"{"x": [1, 2"#,
            "prefix {key: 'v'} suffix",
            r#"{"a": "comma, inside", }"#,
            "{{{",
            "```\n[1, 2,]\n```",
            "",
        ];
        for input in inputs {
            let once = repair_json(input);
            assert_eq!(repair_json(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn test_repair_leaves_string_contents_alone() {
        assert_eq!(
            repair_json(r#"{"text": "it's, fine]", "n": 1,}"#),
            r#"{"n":1,"text":"it's, fine]"}"#
        );
    }

    #[test]
    fn test_parse_valid_json() {
        assert_eq!(parse(r#"{"a": 1}"#), json!({"a": 1}));
        assert_eq!(parse("[1, 2]"), json!([1, 2]));
    }

    #[test]
    fn test_parse_repairs() {
        assert_eq!(parse("{'a': 1,}"), json!({"a": 1}));
        assert_eq!(parse("Answer:\n```json\n{\"v\": 4}\n```"), json!({"v": 4}));
    }

    #[test]
    fn test_parse_wraps_prose_and_scalars() {
        assert_eq!(
            parse("not json at all"),
            json!({"response": "not json at all"})
        );
        assert_eq!(parse("42"), json!({"response": "42"}));
        assert_eq!(parse(r#""quoted""#), json!({"response": "\"quoted\""}));
    }

    #[test]
    fn test_parse_empty_and_unrecoverable() {
        assert_eq!(
            parse("   "),
            json!({"response": "", "error": "empty_response"})
        );
        assert_eq!(
            parse("{\"a"),
            json!({"response": "{\"a", "error": "json_parsing_failed"})
        );
    }

    #[test]
    fn test_wrap_text_as_json() {
        assert_eq!(wrap_text_as_json("  hi  "), json!({"response": "hi"}));
        assert_eq!(
            wrap_text_as_json(""),
            json!({"response": "", "error": "empty_response"})
        );
    }

    #[test]
    fn test_is_quality_response() {
        assert!(is_quality_response(&json!({"response": "long enough text"}), 10));
        assert!(!is_quality_response(&json!({"response": "  short  "}), 10));
        assert!(!is_quality_response(&json!({"response": "long enough text", "error": "x"}), 10));
        assert!(!is_quality_response(&json!({"other": 1}), 0));
        assert!(is_quality_response(&json!({"response": {"nested": true}}), 10));
        assert!(!is_quality_response(&json!("bare"), 0));
    }
}
