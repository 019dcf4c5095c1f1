//! JSON extraction, comparison and transformation
//!
//! Every failure that concerns document content logs a pretty-printed copy of
//! the document it was evaluated against.

pub mod compare;
pub mod path;

use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::error::{AccordError, AccordResult};

pub use compare::{compare, CompareMode, Mismatch};
pub use path::{JsonPath, Segment};

pub fn parse(json: &str) -> AccordResult<Value> {
    Ok(serde_json::from_str(json)?)
}

pub fn pretty(doc: &Value) -> String {
    serde_json::to_string_pretty(doc).unwrap_or_else(|_| doc.to_string())
}

pub fn log_document(doc: &Value) {
    info!("JSON document:\n{}", pretty(doc));
}

/// Parses a step literal: JSON when it parses as JSON, otherwise a string
pub fn literal(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// String form of a value: strings unquoted, everything else as compact JSON
pub fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Value at `path`
pub fn extract(doc: &Value, path: &str) -> AccordResult<Value> {
    let parsed = JsonPath::parse(path)?;
    parsed.select(doc).ok_or_else(|| {
        log_document(doc);
        AccordError::PathNotFound {
            path: path.to_string(),
        }
    })
}

pub fn extract_as<T: DeserializeOwned>(doc: &Value, path: &str) -> AccordResult<T> {
    let value = extract(doc, path)?;
    serde_json::from_value(value).map_err(|e| {
        log_document(doc);
        AccordError::assertion(format!("Value at {} has unexpected type: {}", path, e))
    })
}

/// List at `path`; fails distinctly when the value exists but is not a list
pub fn extract_list(doc: &Value, path: &str) -> AccordResult<Vec<Value>> {
    match extract(doc, path)? {
        Value::Array(items) => Ok(items),
        _ => {
            log_document(doc);
            Err(AccordError::NotAList {
                path: path.to_string(),
            })
        }
    }
}

fn assert_compare(expected: &Value, actual: &Value, mode: CompareMode) -> AccordResult<()> {
    compare(expected, actual, mode).map_err(|m| {
        log_document(actual);
        AccordError::assertion(format!("JSON mismatch at {}", m))
    })
}

/// Same fields on both sides and arrays in the same order
pub fn assert_equal_strict(expected: &Value, actual: &Value) -> AccordResult<()> {
    assert_compare(expected, actual, CompareMode::Strict)
}

/// Only fields present in `expected` are checked
pub fn assert_equivalent_lenient(expected: &Value, actual: &Value) -> AccordResult<()> {
    assert_compare(expected, actual, CompareMode::Lenient)
}

/// Re-orders the array at `path` by the scalar at `sort_path` in each element.
///
/// The sort is stable in both directions, so repeating it is a no-op.
pub fn sort_at_path(doc: &mut Value, path: &str, sort_path: &str, ascending: bool) -> AccordResult<()> {
    let target = JsonPath::parse(path)?;
    let key = JsonPath::parse(sort_path)?;
    if !target.is_definite() {
        return Err(AccordError::InvalidPath {
            path: path.to_string(),
            reason: "sort target must address a single array".to_string(),
        });
    }

    let snapshot = doc.clone();
    let Some(node) = target.select_mut(doc) else {
        log_document(&snapshot);
        return Err(AccordError::PathNotFound {
            path: path.to_string(),
        });
    };
    let Value::Array(items) = node else {
        log_document(&snapshot);
        return Err(AccordError::NotAList {
            path: path.to_string(),
        });
    };

    let mut sort_values = Vec::with_capacity(items.len());
    for item in items.iter() {
        let sort_value = key.select_ref(item).cloned().unwrap_or(Value::Null);
        if sort_value.is_array() || sort_value.is_object() {
            log_document(&snapshot);
            return Err(AccordError::assertion(format!(
                "Sort key {} is not a scalar: {}",
                sort_path, sort_value
            )));
        }
        sort_values.push(sort_value);
    }

    let mut keyed: Vec<(Value, Value)> = sort_values.into_iter().zip(items.drain(..)).collect();

    keyed.sort_by(|(a, _), (b, _)| {
        let ordering = compare_scalars(a, b);
        if ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
    items.extend(keyed.into_iter().map(|(_, item)| item));
    Ok(())
}

fn compare_scalars(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            _ => 3,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

pub fn assert_array_size(doc: &Value, path: &str, expected: usize) -> AccordResult<()> {
    let size = extract_list(doc, path)?.len();
    if size != expected {
        log_document(doc);
        return Err(AccordError::assertion(format!(
            "Expected {} elements at {} but found {}",
            expected, path, size
        )));
    }
    Ok(())
}

pub fn assert_array_size_at_least(doc: &Value, path: &str, minimum: usize) -> AccordResult<()> {
    let size = extract_list(doc, path)?.len();
    if size < minimum {
        log_document(doc);
        return Err(AccordError::assertion(format!(
            "Expected at least {} elements at {} but found {}",
            minimum, path, size
        )));
    }
    Ok(())
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items
            .iter()
            .any(|item| item == needle || text(item) == text(needle)),
        other => text(other).contains(&text(needle)),
    }
}

/// List membership at `path`, or substring containment for non-lists
pub fn assert_contains(doc: &Value, path: &str, needle: &Value) -> AccordResult<()> {
    let value = extract(doc, path)?;
    if !contains(&value, needle) {
        log_document(doc);
        return Err(AccordError::assertion(format!(
            "Expected {} to contain {}",
            path,
            text(needle)
        )));
    }
    Ok(())
}

pub fn assert_not_contains(doc: &Value, path: &str, needle: &Value) -> AccordResult<()> {
    let value = extract(doc, path)?;
    if contains(&value, needle) {
        log_document(doc);
        return Err(AccordError::assertion(format!(
            "Expected {} not to contain {}",
            path,
            text(needle)
        )));
    }
    Ok(())
}
