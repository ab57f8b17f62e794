//! Tolerant repair for model-produced JSON.
//!
//! Keyword and quiz synthesis ask the model for JSON but treat the reply as
//! untrusted: fences are stripped, the outermost object is extracted, open
//! brackets and strings are closed, and parsing is re-attempted exactly once
//! against the repaired text.

use serde_json::Value;

/// Parse `raw` as JSON, repairing common model damage first if needed.
/// Returns `None` when even the repaired text does not parse.
pub fn parse_lenient(raw: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Some(v);
    }
    let repaired = repair(raw);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Produce a best-effort valid JSON text from a noisy model reply.
pub fn repair(raw: &str) -> String {
    let stripped = strip_code_fences(raw);
    let candidate = extract_outer_object(&stripped).unwrap_or(stripped.trim());
    close_open_tokens(candidate)
}

fn strip_code_fences(s: &str) -> &str {
    let t = s.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Extract the first balanced top-level JSON object, tolerating braces inside
/// strings and escape sequences. Falls back to the text from the first `{`
/// when the object never closes.
fn extract_outer_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else {
                match ch {
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    Some(s[start..].trim_end())
}

/// Close an unterminated string and balance any dangling brackets.
fn close_open_tokens(s: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else {
                match ch {
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = s.trim_end().to_string();
    // A trailing comma before a closer is invalid JSON; drop it.
    while out.ends_with(',') {
        out.pop();
    }
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_valid_json_through() {
        let v = parse_lenient(r#"{"keywords": ["a", "b"]}"#).unwrap();
        assert_eq!(v["keywords"][1], "b");
    }

    #[test]
    fn strips_code_fences() {
        let raw = "```json\n{\"keywords\": [\"renal\"]}\n```";
        let v = parse_lenient(raw).unwrap();
        assert_eq!(v["keywords"][0], "renal");
    }

    #[test]
    fn extracts_object_from_surrounding_prose() {
        let raw = "Sure, here are the keywords:\n{\"keywords\": [\"a\"]}\nHope that helps!";
        let v = parse_lenient(raw).unwrap();
        assert_eq!(v["keywords"][0], "a");
    }

    #[test]
    fn balances_dangling_brackets() {
        let raw = r#"{"keywords": ["a", "b""#;
        let v = parse_lenient(raw).unwrap();
        assert_eq!(v["keywords"][0], "a");
        assert_eq!(v["keywords"][1], "b");
    }

    #[test]
    fn closes_unterminated_string() {
        let raw = r#"{"abstract": "a truncated sent"#;
        let v = parse_lenient(raw).unwrap();
        assert!(v["abstract"].as_str().unwrap().starts_with("a truncated"));
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let raw = r#"{"text": "set {x} and [y]"} trailing"#;
        let v = parse_lenient(raw).unwrap();
        assert_eq!(v["text"], "set {x} and [y]");
    }

    #[test]
    fn drops_trailing_comma() {
        let raw = r#"{"keywords": ["a","#;
        let v = parse_lenient(raw).unwrap();
        assert_eq!(v["keywords"][0], "a");
    }

    #[test]
    fn hopeless_input_is_none() {
        assert!(parse_lenient("no json here at all").is_none());
    }
}
