//! Structural comparison of JSON documents

use std::fmt;

use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareMode {
    /// Same fields on both sides, arrays in the same order
    Strict,
    /// Only fields present in the expected document are checked; arrays must
    /// have the same length but may be in any order
    Lenient,
}

/// First difference found between two documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path: String,
    pub message: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub fn compare(expected: &Value, actual: &Value, mode: CompareMode) -> Result<(), Mismatch> {
    compare_at("$", expected, actual, mode)
}

fn mismatch(path: &str, message: String) -> Mismatch {
    Mismatch {
        path: path.to_string(),
        message,
    }
}

fn compare_at(path: &str, expected: &Value, actual: &Value, mode: CompareMode) -> Result<(), Mismatch> {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => compare_objects(path, e, a, mode),
        (Value::Array(e), Value::Array(a)) => {
            if e.len() != a.len() {
                return Err(mismatch(
                    path,
                    format!("expected {} values but got {}", e.len(), a.len()),
                ));
            }
            match mode {
                CompareMode::Strict => {
                    for (i, (ev, av)) in e.iter().zip(a).enumerate() {
                        compare_at(&format!("{}[{}]", path, i), ev, av, mode)?;
                    }
                    Ok(())
                }
                CompareMode::Lenient => compare_unordered(path, e, a),
            }
        }
        (Value::Number(e), Value::Number(a)) => {
            if numbers_equal(e, a) {
                Ok(())
            } else {
                Err(mismatch(path, format!("expected {} but got {}", e, a)))
            }
        }
        (e, a) if e == a => Ok(()),
        (e, a) => Err(mismatch(path, format!("expected {} but got {}", e, a))),
    }
}

/// Integers compare exactly; a float on either side compares as `f64`
fn numbers_equal(e: &Number, a: &Number) -> bool {
    if let (Some(x), Some(y)) = (e.as_i64(), a.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (e.as_u64(), a.as_u64()) {
        return x == y;
    }
    if !e.is_f64() && !a.is_f64() {
        // one side is negative and the other exceeds i64::MAX
        return false;
    }
    match (e.as_f64(), a.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => e == a,
    }
}

fn compare_objects(
    path: &str,
    expected: &Map<String, Value>,
    actual: &Map<String, Value>,
    mode: CompareMode,
) -> Result<(), Mismatch> {
    for (key, ev) in expected {
        let child = format!("{}.{}", path, key);
        match actual.get(key) {
            Some(av) => compare_at(&child, ev, av, mode)?,
            None => return Err(mismatch(&child, "expected field is missing".to_string())),
        }
    }
    if mode == CompareMode::Strict {
        if let Some(extra) = actual.keys().find(|k| !expected.contains_key(*k)) {
            return Err(mismatch(
                &format!("{}.{}", path, extra),
                "unexpected field".to_string(),
            ));
        }
    }
    Ok(())
}

/// Every expected element must match a distinct actual element
fn compare_unordered(path: &str, expected: &[Value], actual: &[Value]) -> Result<(), Mismatch> {
    let candidates: Vec<Vec<usize>> = expected
        .iter()
        .map(|ev| {
            actual
                .iter()
                .enumerate()
                .filter(|(_, av)| compare_at(path, ev, av, CompareMode::Lenient).is_ok())
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    let mut owner: Vec<Option<usize>> = vec![None; actual.len()];
    for i in 0..expected.len() {
        let mut seen = vec![false; actual.len()];
        if !augment(i, &candidates, &mut owner, &mut seen) {
            let child = format!("{}[{}]", path, i);
            if candidates[i].is_empty() {
                // report the difference against the element at the same position
                compare_at(&child, &expected[i], &actual[i], CompareMode::Lenient)?;
            }
            return Err(mismatch(
                &child,
                format!("no matching element for {}", expected[i]),
            ));
        }
    }
    Ok(())
}

fn augment(i: usize, candidates: &[Vec<usize>], owner: &mut [Option<usize>], seen: &mut [bool]) -> bool {
    for &j in &candidates[i] {
        if seen[j] {
            continue;
        }
        seen[j] = true;
        let free = match owner[j] {
            None => true,
            Some(other) => augment(other, candidates, owner, seen),
        };
        if free {
            owner[j] = Some(i);
            return true;
        }
    }
    false
}
