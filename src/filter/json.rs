//! JSON helpers shared by the in-memory filter and metadata matcher.
//!
//! Ordering and equality mirror Postgres `jsonb`, so in-process evaluation
//! selects the same rows as the compiled SQL. Strings compare bytewise,
//! which the SQL side matches with `collate "C"`.

use serde_json::{Number, Value};
use std::cmp::Ordering;

pub(crate) fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

/// Splits `a.b.c` into (`Some("a.b")`, `"c"`).
pub(crate) fn split_leaf(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    }
}

/// Mirrors the `?` operator.
pub(crate) fn has_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => map.contains_key(key),
        Value::Array(items) => items.iter().any(|item| item.as_str() == Some(key)),
        Value::String(s) => s == key,
        _ => false,
    }
}

/// Text form produced by `->>`.
pub(crate) fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

// Integers stay exact past 2^53, like `numeric`.
fn compare_numbers(x: &Number, y: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (integer(x), integer(y)) {
        return x.cmp(&y);
    }
    let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

pub(crate) fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x.len().cmp(&y.len()).then_with(|| {
            x.iter()
                .zip(y)
                .map(|(l, r)| compare(l, r))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()).then_with(|| {
            let mut left: Vec<_> = x.iter().collect();
            let mut right: Vec<_> = y.iter().collect();
            left.sort_by(|l, r| l.0.cmp(r.0));
            right.sort_by(|l, r| l.0.cmp(r.0));
            left.iter()
                .zip(&right)
                .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| compare(lv, rv)))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        _ => rank(a).cmp(&rank(b)),
    }
}

pub(crate) fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Ordering::Equal,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| json_eq(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| json_eq(v, other)))
        }
        _ => a == b,
    }
}

/// Mirrors `@>`: objects contain sub-objects, arrays contain sub-sets.
pub(crate) fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(h), Value::Object(n)) => n
            .iter()
            .all(|(k, v)| h.get(k).is_some_and(|hv| contains(hv, v))),
        (Value::Array(h), Value::Array(n)) => {
            n.iter().all(|nv| h.iter().any(|hv| contains(hv, nv)))
        }
        (Value::Array(h), scalar) if !scalar.is_object() => {
            h.iter().any(|hv| json_eq(hv, scalar))
        }
        _ => json_eq(haystack, needle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ordering_follows_jsonb_type_ranks() {
        assert_eq!(compare(&json!(5), &json!("abc")), Ordering::Greater);
        assert_eq!(compare(&json!(true), &json!(100)), Ordering::Greater);
        assert_eq!(compare(&json!(null), &json!("")), Ordering::Less);
        assert_eq!(compare(&json!(2), &json!(10.5)), Ordering::Less);
    }

    #[test]
    fn strings_order_bytewise() {
        assert_eq!(compare(&json!("B"), &json!("a")), Ordering::Less);
        assert_eq!(compare(&json!("Z"), &json!("ab")), Ordering::Less);
    }

    #[test]
    fn large_integers_keep_their_precision() {
        let big = 9_007_199_254_740_993_i64;
        assert_eq!(compare(&json!(big), &json!(big - 1)), Ordering::Greater);
        assert!(!json_eq(&json!(big), &json!(big - 1)));
        assert_eq!(compare(&json!(u64::MAX), &json!(-1)), Ordering::Greater);
        assert_eq!(compare(&json!(-3), &json!(-2.5)), Ordering::Less);
    }

    #[test]
    fn numbers_equal_across_representations() {
        assert!(json_eq(&json!(1), &json!(1.0)));
        assert!(json_eq(&json!({"a": [1]}), &json!({"a": [1.0]})));
    }

    #[test]
    fn nested_path_lookup_ignores_arrays() {
        let doc = json!({"a": {"b": [{"c": 1}]}});
        assert_eq!(get_path(&doc, "a.b"), Some(&json!([{"c": 1}])));
        assert_eq!(get_path(&doc, "a.b.0"), None);
    }
}
