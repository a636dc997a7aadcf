//! Ordered value→keys index (spec §4.1).
//!
//! Mirrors the shape of the teacher's `trace` module -- an ordered structure mapping an
//! indexed value to the set of keys that currently produce it -- but trimmed to a single
//! in-memory generation rather than a multi-version trace, since the collection keeps only
//! one live snapshot per spec §3's `derivedState`.

use crate::value::{compare_json, get_path, Key, Row};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl IndexOp {
    pub fn name(&self) -> &'static str {
        match self {
            IndexOp::Eq => "eq",
            IndexOp::Gt => "gt",
            IndexOp::Gte => "gte",
            IndexOp::Lt => "lt",
            IndexOp::Lte => "lte",
            IndexOp::In => "in",
        }
    }
}

/// Stats tracked per spec §4.1 ("tracks lookup count and last-updated timestamp"); exposed
/// via [`Index::stats`] since the spec describes the bookkeeping but never names an accessor
/// (SPEC_FULL §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub lookup_count: u64,
    pub last_updated_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single entry in the ordered side of the index: an indexed value and the keys that
/// currently produce it, in insertion order (ties within a bucket break by insertion order).
struct Bucket {
    value: Json,
    keys: Vec<Key>,
}

pub struct Index {
    pub id: u64,
    pub name: String,
    path: Vec<String>,
    ordered: Vec<Bucket>,
    by_value: HashMap<String, usize>,
    stats: IndexStats,
}

fn canonical(v: &Json) -> String {
    v.to_string()
}

impl Index {
    pub fn new(id: u64, name: impl Into<String>, path: Vec<String>) -> Self {
        Index {
            id,
            name: name.into(),
            path,
            ordered: Vec::new(),
            by_value: HashMap::new(),
            stats: IndexStats::default(),
        }
    }

    pub fn matches_field(&self, path: &[String]) -> bool {
        self.path == path
    }

    pub fn supports(&self, _op: IndexOp) -> bool {
        true
    }

    fn eval(&self, item: &Row) -> Json {
        get_path(item, &self.path).clone()
    }

    /// Builds the index from scratch over `items`. Evaluation errors are impossible here
    /// since `get_path` never fails (missing paths read as `null`); kept as a `Result` to
    /// match the fallible contract of `add`.
    pub fn build<'a>(&mut self, items: impl Iterator<Item = (&'a Key, &'a Row)>) {
        self.ordered.clear();
        self.by_value.clear();
        for (key, item) in items {
            self.add(key.clone(), item);
        }
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.by_value.clear();
    }

    pub fn add(&mut self, key: Key, item: &Row) {
        let value = self.eval(item);
        let canon = canonical(&value);
        match self.by_value.get(&canon).copied() {
            Some(idx) => {
                self.ordered[idx].keys.push(key);
            }
            None => {
                let pos = self
                    .ordered
                    .binary_search_by(|b| compare_json(&b.value, &value))
                    .unwrap_or_else(|e| e);
                self.ordered.insert(
                    pos,
                    Bucket {
                        value,
                        keys: vec![key],
                    },
                );
                self.reindex_from(pos);
            }
        }
        self.stats.last_updated_ms = now_ms();
    }

    pub fn remove(&mut self, key: &Key, item: &Row) {
        let value = self.eval(item);
        let canon = canonical(&value);
        let Some(&idx) = self.by_value.get(&canon) else {
            warn!(field = ?self.path, "index remove: value not found, skipping");
            return;
        };
        let bucket = &mut self.ordered[idx];
        bucket.keys.retain(|k| k != key);
        if bucket.keys.is_empty() {
            self.ordered.remove(idx);
            self.by_value.remove(&canon);
            self.reindex_from(idx);
        }
        self.stats.last_updated_ms = now_ms();
    }

    pub fn update(&mut self, key: &Key, old_item: &Row, new_item: &Row) {
        self.remove(key, old_item);
        self.add(key.clone(), new_item);
    }

    fn reindex_from(&mut self, from: usize) {
        for i in from..self.ordered.len() {
            self.by_value.insert(canonical(&self.ordered[i].value), i);
        }
    }

    /// Performs `op` against `value`, returning the matching keys. Ties within a single
    /// bucket preserve insertion order (spec §4.1: "ties break by insertion order within a
    /// bucket") since `Bucket.keys` is itself insertion-ordered -- this must stay a `Vec`,
    /// not a `BTreeSet`, or that ordering guarantee is silently replaced by `Key`'s `Ord`.
    pub fn lookup(&mut self, op: IndexOp, value: &Json) -> Vec<Key> {
        self.stats.lookup_count += 1;
        let mut out = Vec::new();
        match op {
            IndexOp::Eq => {
                if let Some(&idx) = self.by_value.get(&canonical(value)) {
                    out.extend(self.ordered[idx].keys.iter().cloned());
                }
            }
            IndexOp::In => {
                if let Json::Array(values) = value {
                    for v in values {
                        if let Some(&idx) = self.by_value.get(&canonical(v)) {
                            out.extend(self.ordered[idx].keys.iter().cloned());
                        }
                    }
                }
            }
            IndexOp::Gt | IndexOp::Gte | IndexOp::Lt | IndexOp::Lte => {
                let start = self
                    .ordered
                    .partition_point(|b| compare_json(&b.value, value) == std::cmp::Ordering::Less);
                match op {
                    IndexOp::Gt => {
                        let from = self.ordered[start..]
                            .iter()
                            .position(|b| compare_json(&b.value, value) != std::cmp::Ordering::Equal)
                            .map(|p| start + p)
                            .unwrap_or(self.ordered.len());
                        for b in &self.ordered[from..] {
                            out.extend(b.keys.iter().cloned());
                        }
                    }
                    IndexOp::Gte => {
                        for b in &self.ordered[start..] {
                            out.extend(b.keys.iter().cloned());
                        }
                    }
                    IndexOp::Lt => {
                        for b in &self.ordered[..start] {
                            out.extend(b.keys.iter().cloned());
                        }
                    }
                    IndexOp::Lte => {
                        let end = self.ordered[start..]
                            .iter()
                            .position(|b| compare_json(&b.value, value) != std::cmp::Ordering::Equal)
                            .map(|p| start + p)
                            .unwrap_or(self.ordered.len());
                        for b in &self.ordered[..end] {
                            out.extend(b.keys.iter().cloned());
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }
        out
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(age: i64) -> Row {
        json!({ "age": age })
    }

    #[test]
    fn range_queries() {
        let mut idx = Index::new(1, "auto_age", vec!["age".to_string()]);
        idx.add(Key::Number(1), &row(25));
        idx.add(Key::Number(2), &row(30));
        idx.add(Key::Number(3), &row(35));

        let hits = idx.lookup(IndexOp::Gte, &json!(30));
        assert_eq!(hits, vec![Key::Number(2), Key::Number(3)]);
    }

    #[test]
    fn remove_drops_empty_bucket() {
        let mut idx = Index::new(1, "auto_age", vec!["age".to_string()]);
        idx.add(Key::Number(1), &row(25));
        idx.remove(&Key::Number(1), &row(25));
        assert!(idx.lookup(IndexOp::Eq, &json!(25)).is_empty());
    }

    #[test]
    fn eq_index_matches_derived_state_invariant() {
        let mut idx = Index::new(1, "auto_age", vec!["age".to_string()]);
        idx.add(Key::Number(1), &row(25));
        idx.add(Key::Number(2), &row(25));
        let hits = idx.lookup(IndexOp::Eq, &json!(25));
        assert_eq!(hits, vec![Key::Number(1), Key::Number(2)]);
    }

    /// Regression for the insertion-order guarantee: `Key::Number(2)` is added to the bucket
    /// before `Key::Number(1)`, an order that disagrees with `Key`'s derived `Ord`. A lookup
    /// must return them in the order they were inserted, not renumbered by value.
    #[test]
    fn eq_lookup_preserves_insertion_order_within_a_bucket() {
        let mut idx = Index::new(1, "auto_age", vec!["age".to_string()]);
        idx.add(Key::Number(2), &row(25));
        idx.add(Key::Number(1), &row(25));
        let hits = idx.lookup(IndexOp::Eq, &json!(25));
        assert_eq!(hits, vec![Key::Number(2), Key::Number(1)]);
    }
}
