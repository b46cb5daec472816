//! Snippets from the embedded search state JSON
//!
//! Some saved pages carry no rendered snippets, only the state blob inside
//! `<noframes id="lazy-react-state-post-search">`. Each snippet object is
//! mapped through the `jsonKeys` of the `#` rules.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::extractors::fields::apply_host_fallbacks;
use crate::extractors::price::format_price_text;
use crate::extractors::text::{clean_text, normalize_url, parse_rating};
use crate::row::{fields, Row, SnippetType};
use crate::rules::{CompiledRules, ValueType};

static STATE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<noframes[^>]*id=["']lazy-react-state-post-search["'][^>]*>(.*?)</noframes>"#)
        .expect("static regex")
});

const ARRAY_KEYS: &[&str] = &["results", "items", "snippets", "organic", "products"];
const NESTED_ARRAY_KEYS: &[&str] = &["results", "items"];
const MAX_SEARCH_DEPTH: usize = 5;

/// Parsed state blob of the page, if present and valid
pub fn find_state(html: &str) -> Option<Value> {
    let raw = STATE_BLOCK.captures(html)?.get(1)?.as_str().trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "search state JSON is invalid");
            None
        }
    }
}

/// The array of snippet objects inside the state
pub fn snippet_array(state: &Value) -> Option<&Vec<Value>> {
    for key in ARRAY_KEYS {
        if let Some(array) = state.get(key).and_then(Value::as_array) {
            return Some(array);
        }
    }
    if let Some(data) = state.get("data") {
        for key in NESTED_ARRAY_KEYS {
            if let Some(array) = data.get(key).and_then(Value::as_array) {
                return Some(array);
            }
        }
    }
    if let Some(array) = state.as_array() {
        return Some(array);
    }
    find_snippet_like_array(state, 0)
}

fn looks_like_snippet(object: &Map<String, Value>) -> bool {
    object.keys().any(|key| {
        let key = key.to_lowercase();
        key.contains("title") || key.contains("url") || key.contains("price")
    })
}

fn find_snippet_like_array(value: &Value, depth: usize) -> Option<&Vec<Value>> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }
    match value {
        Value::Array(items) => {
            if items.first().and_then(Value::as_object).is_some_and(looks_like_snippet) {
                return Some(items);
            }
            items
                .iter()
                .find_map(|item| find_snippet_like_array(item, depth + 1))
        }
        Value::Object(object) => object
            .values()
            .find_map(|item| find_snippet_like_array(item, depth + 1)),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Row for one snippet object, `None` for non-objects
pub fn row_from_json(snippet: &Value, rules: &CompiledRules) -> Option<Row> {
    let object = snippet.as_object()?;

    let snippet_type = rules
        .rule(fields::SNIPPET_TYPE)
        .into_iter()
        .flat_map(|rule| rule.json_keys.iter())
        .filter_map(|key| object.get(key).and_then(scalar_text))
        .find_map(|name| SnippetType::from_name(&name))
        .unwrap_or(SnippetType::Organic);
    let mut row = Row::new(snippet_type.as_str());

    for (name, rule) in rules.row_fields() {
        if name == fields::SNIPPET_TYPE {
            continue;
        }
        let value = rule
            .json_keys
            .iter()
            .filter_map(|key| object.get(key).and_then(scalar_text))
            .find_map(|raw| match rule.value_type {
                ValueType::Price => format_price_text(&raw),
                ValueType::Image | ValueType::Attribute => Some(normalize_url(&raw)),
                ValueType::Rating => parse_rating(&raw),
                ValueType::Boolean => Some("true".to_string()),
                ValueType::Text | ValueType::Html => Some(clean_text(&raw)),
            });
        if let Some(value) = value {
            row.set(name, value);
        }
    }

    if let Some(image) = row.get(fields::IMAGE).map(str::to_string) {
        row.set_if_absent(fields::THUMB_IMAGE, image);
    }
    apply_host_fallbacks(&mut row);
    Some(row)
}

/// Rows for every snippet in the page's state blob
pub fn extract_rows(html: &str, rules: &CompiledRules) -> Vec<Row> {
    let state = match find_state(html) {
        Some(state) => state,
        None => return Vec::new(),
    };
    let snippets = match snippet_array(&state) {
        Some(array) => array,
        None => {
            debug!("search state has no snippet array");
            return Vec::new();
        }
    };
    let rows: Vec<Row> = snippets
        .iter()
        .filter_map(|snippet| row_from_json(snippet, rules))
        .collect();
    debug!(rows = rows.len(), "rows read from search state");
    rows
}
