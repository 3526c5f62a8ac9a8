//! Shared utility functions used across the codebase.

use std::sync::OnceLock;

use regex::Regex;

/// Current wall-clock time as an RFC 3339 string (UTC).
pub fn now_string() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Truncate `text` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn think_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"))
}

fn json_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("valid regex"))
}

fn any_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)```").expect("valid regex"))
}

/// Remove `<think>…</think>` blocks emitted by reasoning models.
///
/// A dangling `</think>` (the opening tag was cut off by the provider) drops
/// everything before it.
pub fn strip_think_tags(text: &str) -> String {
    let stripped = think_block_re().replace_all(text, "");
    match stripped.rfind("</think>") {
        Some(idx) => stripped[idx + "</think>".len()..].trim().to_string(),
        None => stripped.trim().to_string(),
    }
}

/// Find the first balanced `{…}` object in `text`.
///
/// String literals are honoured so braces inside quoted values do not
/// disturb the depth count.
pub fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the JSON payload from a model response.
///
/// Order of preference: think-tags removed, then a ```json fenced block,
/// then any fenced block that looks like JSON, then the first balanced
/// object. Already-clean JSON comes back unchanged.
pub fn extract_json(response: &str) -> String {
    let cleaned = strip_think_tags(response);

    if let Some(caps) = json_fence_re().captures(&cleaned) {
        return caps[1].trim().to_string();
    }
    if let Some(caps) = any_fence_re().captures(&cleaned) {
        let inner = caps[1].trim();
        if inner.starts_with('{') || inner.starts_with('[') {
            return inner.to_string();
        }
    }
    match balanced_object(&cleaned) {
        Some(obj) => obj.to_string(),
        None => cleaned,
    }
}
