//! JSON object extraction from LLM judge responses.
//!
//! Judges are asked for a bare JSON object but routinely wrap it in a
//! markdown fence or surround it with prose. Strategies, in order:
//! 1. A ```json fenced block
//! 2. Any fenced block
//! 3. The whole response, if it is an object
//! 4. The last balanced `{...}` that parses (reasoning text often precedes it)
//! 5. Earlier balanced `{...}` spans, last to first

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why no JSON object could be pulled out of a response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON object appears truncated ({unclosed} unclosed braces)")]
    Truncated { unclosed: usize },

    #[error("No JSON object found in response starting with '{preview}'")]
    NotFound { preview: String },
}

fn fenced_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```([A-Za-z0-9_-]*)[ \t]*\r?\n(.*?)```")
            .expect("Invalid regex for fenced blocks")
    })
}

/// Extracts the first usable JSON object from `content`.
pub fn extract_json_object(content: &str) -> Result<Map<String, Value>, JsonExtractionError> {
    let trimmed = content.trim();

    let blocks: Vec<(String, String)> = fenced_block_regex()
        .captures_iter(trimmed)
        .map(|c| (c[1].to_ascii_lowercase(), c[2].trim().to_string()))
        .collect();

    for (lang, body) in &blocks {
        if lang == "json" {
            if let Some(object) = parse_object(body) {
                return Ok(object);
            }
        }
    }
    for (_, body) in &blocks {
        if let Some(object) = parse_object(body) {
            return Ok(object);
        }
    }

    if let Some(object) = parse_object(trimmed) {
        return Ok(object);
    }

    let candidates = balanced_objects(trimmed);
    for candidate in candidates.iter().rev() {
        if let Some(object) = parse_object(candidate) {
            return Ok(object);
        }
    }

    let unclosed = unclosed_braces(trimmed);
    if unclosed > 0 {
        return Err(JsonExtractionError::Truncated { unclosed });
    }

    Err(JsonExtractionError::NotFound {
        preview: trimmed.chars().take(50).collect(),
    })
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Returns the index of the `}` closing the object that starts at `s[0]`.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// All top-level balanced `{...}` spans, in order of appearance.
fn balanced_objects(s: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut offset = 0;
    while let Some(start) = s[offset..].find('{') {
        let start = offset + start;
        match find_matching_brace(&s[start..]) {
            Some(end) => {
                spans.push(&s[start..=start + end]);
                offset = start + end + 1;
            }
            None => break,
        }
    }
    spans
}

fn unclosed_braces(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}
