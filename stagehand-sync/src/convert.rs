//! Conversion between `serde_json::Value` trees and yrs shared types.
//!
//! Writes are diff-aware: only leaves whose value changed are touched,
//! nested objects become `YMap`s created on first use, and arrays become
//! `YArray`s updated element by element. Two replicas that change disjoint
//! leaves of the same tree therefore merge without losing either edit.

use serde_json::{Map as JsonMap, Number, Value};
use yrs::{Any, Array, ArrayPrelim, ArrayRef, Map, MapPrelim, MapRef, Out, ReadTxn, TransactionMut};

// ───────────────────────────────────────────────────────────────────
// Reading
// ───────────────────────────────────────────────────────────────────

pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|&b| Value::from(b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

pub fn out_to_json<T: ReadTxn>(txn: &T, out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        Out::YMap(map) => map_to_json(txn, map),
        Out::YArray(array) => array_to_json(txn, array),
        _ => Value::Null,
    }
}

pub fn map_to_json<T: ReadTxn>(txn: &T, map: &MapRef) -> Value {
    let mut object = JsonMap::new();
    for (key, value) in map.iter(txn) {
        object.insert(key.to_string(), out_to_json(txn, &value));
    }
    Value::Object(object)
}

pub fn array_to_json<T: ReadTxn>(txn: &T, array: &ArrayRef) -> Value {
    Value::Array(array.iter(txn).map(|item| out_to_json(txn, &item)).collect())
}

/// Read a nested map under `key`, if present.
pub fn get_map<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<MapRef> {
    match parent.get(txn, key) {
        Some(Out::YMap(map)) => Some(map),
        _ => None,
    }
}

/// Read a nested array under `key`, if present.
pub fn get_array<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<ArrayRef> {
    match parent.get(txn, key) {
        Some(Out::YArray(array)) => Some(array),
        _ => None,
    }
}

/// Get the nested map under `key`, creating it if absent or not a map.
pub fn get_or_create_map(txn: &mut TransactionMut, parent: &MapRef, key: &str) -> MapRef {
    match get_map(&*txn, parent, key) {
        Some(map) => map,
        None => parent.insert(txn, key, MapPrelim::default()),
    }
}

/// Get the nested array under `key`, creating it if absent or not an array.
pub fn get_or_create_array(txn: &mut TransactionMut, parent: &MapRef, key: &str) -> ArrayRef {
    match get_array(&*txn, parent, key) {
        Some(array) => array,
        None => parent.insert(txn, key, ArrayPrelim::default()),
    }
}

// ───────────────────────────────────────────────────────────────────
// Writing
// ───────────────────────────────────────────────────────────────────

/// Scalar JSON to `Any`. Integers keep integer identity so they read back
/// as integers.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(entries) => Any::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<std::collections::HashMap<_, _>>()
                .into(),
        ),
    }
}

/// Replace `key` with a freshly built value.
pub fn insert_value(txn: &mut TransactionMut, map: &MapRef, key: &str, value: &Value) {
    match value {
        Value::Object(entries) => {
            let nested = map.insert(txn, key, MapPrelim::default());
            for (k, v) in entries {
                insert_value(txn, &nested, k, v);
            }
        }
        Value::Array(items) => {
            let nested = map.insert(txn, key, ArrayPrelim::default());
            for item in items {
                push_value(txn, &nested, item);
            }
        }
        scalar => {
            map.insert(txn, key, json_to_any(scalar));
        }
    }
}

/// Append a freshly built value to an array.
pub fn push_value(txn: &mut TransactionMut, array: &ArrayRef, value: &Value) {
    let index = array.len(&*txn);
    insert_at(txn, array, index, value);
}

/// Insert a freshly built value at `index`.
pub fn insert_at(txn: &mut TransactionMut, array: &ArrayRef, index: u32, value: &Value) {
    match value {
        Value::Object(entries) => {
            let nested = array.insert(txn, index, MapPrelim::default());
            for (k, v) in entries {
                insert_value(txn, &nested, k, v);
            }
        }
        Value::Array(items) => {
            let nested = array.insert(txn, index, ArrayPrelim::default());
            for item in items {
                push_value(txn, &nested, item);
            }
        }
        scalar => {
            array.insert(txn, index, json_to_any(scalar));
        }
    }
}

/// Write `value` under `key`, touching only what differs.
///
/// Returns true if anything was written.
pub fn merge_value(txn: &mut TransactionMut, map: &MapRef, key: &str, value: &Value) -> bool {
    let current = map.get(&*txn, key);
    match (current, value) {
        (Some(Out::YMap(nested)), Value::Object(entries)) => merge_object(txn, &nested, entries, true),
        (Some(Out::YArray(nested)), Value::Array(items)) => merge_array(txn, &nested, items),
        (Some(Out::Any(existing)), scalar) if !scalar.is_object() && !scalar.is_array() => {
            if any_to_json(&existing) == *scalar {
                false
            } else {
                map.insert(txn, key, json_to_any(scalar));
                true
            }
        }
        _ => {
            insert_value(txn, map, key, value);
            true
        }
    }
}

/// Merge an object into a map. With `prune`, keys missing from `entries`
/// are removed.
pub fn merge_object(
    txn: &mut TransactionMut,
    map: &MapRef,
    entries: &JsonMap<String, Value>,
    prune: bool,
) -> bool {
    let mut changed = false;
    if prune {
        let stale: Vec<String> = map
            .keys(&*txn)
            .filter(|k| !entries.contains_key(*k))
            .map(str::to_string)
            .collect();
        for key in stale {
            map.remove(txn, &key);
            changed = true;
        }
    }
    for (key, value) in entries {
        changed |= merge_value(txn, map, key, value);
    }
    changed
}

/// Merge a list into an array element by element.
pub fn merge_array(txn: &mut TransactionMut, array: &ArrayRef, items: &[Value]) -> bool {
    let mut changed = false;
    let len = array.len(&*txn);
    let target = u32::try_from(items.len()).unwrap_or(u32::MAX);
    let common = len.min(target);

    for index in 0..common {
        let item = &items[index as usize];
        let current = array.get(&*txn, index);
        changed |= match (current, item) {
            (Some(Out::YMap(nested)), Value::Object(entries)) => merge_object(txn, &nested, entries, true),
            (Some(Out::YArray(nested)), Value::Array(inner)) => merge_array(txn, &nested, inner),
            (Some(Out::Any(existing)), scalar) if any_to_json(&existing) == *scalar => false,
            _ => {
                array.remove(txn, index);
                insert_at(txn, array, index, item);
                true
            }
        };
    }

    if len > target {
        array.remove_range(txn, target, len - target);
        changed = true;
    }
    for item in items.iter().skip(common as usize) {
        push_value(txn, array, item);
        changed = true;
    }
    changed
}

// ───────────────────────────────────────────────────────────────────
// Plain JSON path helpers (used for optimistic local views)
// ───────────────────────────────────────────────────────────────────

/// Set `value` at `path` inside a JSON tree. Missing or null parents become
/// objects; a segment under an array must be an index of an existing
/// element.
///
/// Returns false, leaving the tree untouched, for an empty path or one that
/// runs into a scalar or a bad array index.
pub fn set_path(tree: &mut Value, path: &[String], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut node = tree;
    for segment in parents {
        if node.is_null() {
            *node = Value::Object(JsonMap::new());
        }
        node = match node {
            Value::Object(object) => object
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(JsonMap::new())),
            Value::Array(items) => match array_index(items, segment) {
                Some(index) => &mut items[index],
                None => return false,
            },
            _ => return false,
        };
    }
    if node.is_null() {
        *node = Value::Object(JsonMap::new());
    }
    match node {
        Value::Object(object) => {
            object.insert(last.clone(), value);
            true
        }
        Value::Array(items) => match array_index(items, last) {
            Some(index) => {
                items[index] = value;
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// Read the value at `path`, if every segment exists.
pub fn get_path<'a>(tree: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(tree, |node, segment| match node {
        Value::Array(items) => array_index(items, segment).map(|index| &items[index]),
        _ => node.get(segment),
    })
}

fn array_index(items: &[Value], segment: &str) -> Option<usize> {
    segment.parse::<usize>().ok().filter(|&index| index < items.len())
}
