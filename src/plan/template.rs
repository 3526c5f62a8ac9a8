//! `${path}` placeholder substitution for step arguments.
//!
//! Paths are dotted (`step_2.results.count`); numeric segments index into
//! arrays. Unresolved placeholders become empty strings so that a minor
//! planning mistake does not abort a whole execution.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\s*([^}]*?)\s*\}").expect("valid regex"))
}

fn lookup_value<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Resolve a path to an owned value, descending into JSON-encoded strings.
pub fn resolve(results: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut segments = path.split('.').filter(|s| !s.is_empty());
    let mut current = results.get(segments.next()?)?.clone();
    for segment in segments {
        if let Value::String(s) = &current {
            match serde_json::from_str::<Value>(s) {
                Ok(parsed) if parsed.is_object() || parsed.is_array() => current = parsed,
                _ => return None,
            }
        }
        current = lookup_value(&current, segment)?.clone();
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute placeholders inside a single string.
///
/// A string that is exactly one placeholder yields the referenced value with
/// its JSON type intact.
pub fn substitute_str(input: &str, results: &Map<String, Value>) -> Value {
    let re = placeholder_re();
    let Some(whole) = re.captures(input) else {
        return Value::String(input.to_string());
    };
    if let Some(m) = whole.get(0) {
        if m.start() == 0 && m.end() == input.len() {
            return resolve(results, &whole[1]).unwrap_or_else(|| Value::String(String::new()));
        }
    }

    let replaced = re.replace_all(input, |caps: &regex::Captures<'_>| {
        resolve(results, &caps[1]).map(|v| render(&v)).unwrap_or_default()
    });
    Value::String(replaced.into_owned())
}

/// Recursively substitute placeholders in any JSON value.
pub fn substitute(value: &Value, results: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, results),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, results)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, results)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute placeholders in a step's argument map.
pub fn substitute_arguments(
    arguments: &Map<String, Value>,
    results: &Map<String, Value>,
) -> Map<String, Value> {
    arguments
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, results)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results() -> Map<String, Value> {
        json!({
            "step_1": {"value": "hello", "items": [10, 20]},
            "step_2": {"results": {"count": 3}},
            "step_3": "{\"nested\":{\"ok\":true}}"
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn interpolates_inside_text() {
        let out = substitute_str("${step_1.value}, world", &results());
        assert_eq!(out, json!("hello, world"));
    }

    #[test]
    fn whole_placeholder_keeps_type() {
        assert_eq!(substitute_str("${step_2.results.count}", &results()), json!(3));
        assert_eq!(substitute_str("${step_1.items.1}", &results()), json!(20));
        assert_eq!(
            substitute_str("${step_1}", &results()),
            json!({"value": "hello", "items": [10, 20]})
        );
    }

    #[test]
    fn unknown_paths_become_empty() {
        assert_eq!(substitute_str("${step_9.value}", &results()), json!(""));
        assert_eq!(substitute_str("x=${nope}!", &results()), json!("x=!"));
    }

    #[test]
    fn descends_into_json_strings() {
        assert_eq!(substitute_str("${step_3.nested.ok}", &results()), json!(true));
    }

    #[test]
    fn recurses_through_arguments() {
        let args = json!({"a": ["${step_2.results.count}", "n=${step_2.results.count}"], "b": {"c": "${step_1.value}"}, "d": 5});
        let out = substitute_arguments(args.as_object().unwrap(), &results());
        assert_eq!(
            Value::Object(out),
            json!({"a": [3, "n=3"], "b": {"c": "hello"}, "d": 5})
        );
    }
}
