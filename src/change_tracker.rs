//! Structural change tracking (spec §4.2), re-architected per SPEC_FULL/Design Notes.
//!
//! The original system interposes proxies on a mutable draft and records writes as they
//! happen. Rust has no equivalent meta-programming hook, so this module instead offers the
//! "patch" shape named in the Design Notes: callers mutate an owned clone of a row through
//! [`with_change_tracking`], and the tracker diffs the clone against the original afterward.
//! The observable contract is unchanged: a mutate-then-revert round trip yields an empty
//! changeset, and the changeset is the minimal set of changed fields -- nested objects are
//! diffed recursively rather than replaced wholesale, so a one-field edit three levels deep
//! produces a three-level-deep changeset rather than a full subtree replacement.

use crate::value::Row;
use serde_json::{Map, Value as Json};

/// Mutates a clone of `original` through `mutate`, then returns the minimal changeset
/// (`Json::Null` wrapped as an empty object means "no change"). Collection-mutating edits to
/// arrays are treated as whole-value replacements: arrays have no natural per-index merge
/// semantics once `splice`/`sort`/`reverse` are considered, so a changed array's entire new
/// value is recorded, matching the teacher's array handling at the container-method level.
pub fn with_change_tracking(original: &Row, mutate: impl FnOnce(&mut Row)) -> Row {
    let mut draft = original.clone();
    mutate(&mut draft);
    diff(original, &draft)
}

/// Structural diff of `before` -> `after`, returning the minimal delta such that
/// `apply_changes(before, diff(before, after)) == after` for the common case of object
/// rows. A field present in `before` but removed in `after` is recorded as `null` (the
/// tombstone convention `apply_changes` understands); an empty object diff means no change.
pub fn diff(before: &Json, after: &Json) -> Json {
    match (before, after) {
        (Json::Object(b), Json::Object(a)) => {
            let mut out = Map::new();
            for (k, av) in a {
                match b.get(k) {
                    Some(bv) if bv == av => {}
                    Some(bv) => {
                        let nested = diff(bv, av);
                        let is_empty_nested =
                            matches!(&nested, Json::Object(m) if m.is_empty()) && bv.is_object() && av.is_object();
                        if !is_empty_nested {
                            if bv.is_object() && av.is_object() {
                                out.insert(k.clone(), nested);
                            } else {
                                out.insert(k.clone(), av.clone());
                            }
                        }
                    }
                    None => {
                        out.insert(k.clone(), av.clone());
                    }
                }
            }
            for k in b.keys() {
                if !a.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            Json::Object(out)
        }
        _ if before == after => Json::Object(Map::new()),
        _ => after.clone(),
    }
}

/// True when a changeset (as returned by `diff`/`with_change_tracking`) carries no edits.
pub fn is_empty_changeset(changes: &Json) -> bool {
    matches!(changes, Json::Object(m) if m.is_empty()) || changes.is_null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::apply_changes;
    use serde_json::json;

    #[test]
    fn net_zero_edit_is_empty() {
        let original = json!({"v": "a"});
        let changes = with_change_tracking(&original, |draft| {
            draft["v"] = json!("b");
            draft["v"] = json!("a");
        });
        assert!(is_empty_changeset(&changes));
    }

    #[test]
    fn minimal_delta_on_single_field() {
        let original = json!({"id": 1, "name": "A", "nested": {"x": 1, "y": 2}});
        let changes = with_change_tracking(&original, |draft| {
            draft["nested"]["x"] = json!(9);
        });
        assert_eq!(changes, json!({"nested": {"x": 9}}));
    }

    #[test]
    fn round_trips_through_apply_changes() {
        let original = json!({"id": 1, "v": "a"});
        let changes = with_change_tracking(&original, |draft| {
            draft["v"] = json!("b");
        });
        let merged = apply_changes(&original, &changes);
        assert_eq!(merged, json!({"id": 1, "v": "b"}));
    }

    #[test]
    fn deletion_recorded_as_null_tombstone() {
        let original = json!({"id": 1, "v": "a"});
        let changes = with_change_tracking(&original, |draft| {
            draft.as_object_mut().unwrap().remove("v");
        });
        assert_eq!(changes, json!({"v": null}));
        let merged = apply_changes(&original, &changes);
        assert_eq!(merged, json!({"id": 1}));
    }
}
