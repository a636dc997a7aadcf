//! The dynamic row and key representation shared by every layer of the engine.
//!
//! Rows are `serde_json::Value` objects so that the query builder's property-path
//! expressions (`Expr::Prop`) can resolve against arbitrary caller-defined shapes without a
//! macro-generated schema, mirroring how the teacher dataflow is generic over `Data: Clone +
//! 'static` but letting us additionally reach into a row by field name at compile-the-query
//! time rather than at Rust-compile time.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::fmt;

pub type Row = Json;

/// A primitive key: string or number, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, Eq)]
#[serde(untagged)]
pub enum Key {
    String(String),
    Number(i64),
}

impl Key {
    pub fn from_row_hash(row: &Row) -> Key {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        canonical_string(row).hash(&mut hasher);
        Key::Number(hasher.finish() as i64)
    }
}

fn canonical_string(row: &Row) -> String {
    // BTreeMap-backed canonicalization is unnecessary: serde_json preserves insertion
    // order, so sort keys explicitly to make the hash independent of field order.
    fn sorted(v: &Json) -> Json {
        match v {
            Json::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, val) in entries {
                    out.insert(k.clone(), sorted(val));
                }
                Json::Object(out)
            }
            Json::Array(items) => Json::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(row).to_string()
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::String(s) => write!(f, "{s}"),
            Key::Number(n) => write!(f, "{n}"),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::String(a), Key::String(b)) => a == b,
            (Key::Number(a), Key::Number(b)) => a == b,
            _ => false,
        }
    }
}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Key::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Key::Number(n) => {
                1u8.hash(state);
                n.hash(state);
            }
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Number(a), Key::Number(b)) => a.cmp(b),
            (Key::String(_), Key::Number(_)) => Ordering::Greater,
            (Key::Number(_), Key::String(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reads a dotted property path (`"address.city"`) out of a row. Missing segments yield
/// `Json::Null`, matching the builder's "ref proxy" semantics where an absent field reads
/// as undefined rather than erroring.
pub fn get_path<'a>(row: &'a Row, path: &[String]) -> &'a Json {
    static NULL: Json = Json::Null;
    let mut cur = row;
    for segment in path {
        match cur.get(segment) {
            Some(v) => cur = v,
            None => return &NULL,
        }
    }
    cur
}

/// Total order over arbitrary JSON values, used by ORDER BY and the B+Tree index.
/// Numbers order before strings order before booleans order before null/other, which is an
/// arbitrary but total and stable choice -- consistent with the "ties break by insertion
/// order" rule layered on top by the index and topK operator.
pub fn compare_json(a: &Json, b: &Json) -> Ordering {
    fn rank(v: &Json) -> u8 {
        match v {
            Json::Null => 0,
            Json::Bool(_) => 1,
            Json::Number(_) => 2,
            Json::String(_) => 3,
            Json::Array(_) => 4,
            Json::Object(_) => 5,
        }
    }
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Null, Json::Null) => Ordering::Equal,
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Applies a flat set of field changes (as produced by [`crate::change_tracker`]) onto a
/// base row, producing `original ⊕ changes` per spec §3's `PendingMutation.modified`.
pub fn apply_changes(original: &Row, changes: &Row) -> Row {
    match (original, changes) {
        (Json::Object(base), Json::Object(delta)) => {
            let mut merged = base.clone();
            for (k, v) in delta {
                if v.is_null() {
                    merged.remove(k);
                } else {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Json::Object(merged)
        }
        _ => changes.clone(),
    }
}
