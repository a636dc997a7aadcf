//! Schema validation (spec §3, "Schema validation" / "Standard Schema").
//!
//! The original system accepts any Standard Schema-compliant validator object. The Rust
//! equivalent is a small trait object so collections can stay agnostic of the concrete
//! validation library a caller picks (hand-rolled checks, a generated JSON-schema validator,
//! whatever fits the row type).

use crate::error::{ValidationIssue, ValidationKind};
use crate::value::Row;

/// A synchronous row validator. `validate` is called with the fully-materialized candidate
/// row (for updates: the base row merged with the incoming changes), not the raw delta --
/// partial-update validation against a full-row schema isn't representable otherwise.
pub trait Schema: Send + Sync {
    fn validate(&self, candidate: &Row, kind: ValidationKind) -> Result<(), Vec<ValidationIssue>>;
}

/// A schema built from a plain predicate closure, for callers who don't need structured
/// issue paths.
pub struct PredicateSchema<F> {
    message: String,
    predicate: F,
}

impl<F> PredicateSchema<F>
where
    F: Fn(&Row) -> bool + Send + Sync,
{
    pub fn new(message: impl Into<String>, predicate: F) -> Self {
        PredicateSchema {
            message: message.into(),
            predicate,
        }
    }
}

impl<F> Schema for PredicateSchema<F>
where
    F: Fn(&Row) -> bool + Send + Sync,
{
    fn validate(&self, candidate: &Row, _kind: ValidationKind) -> Result<(), Vec<ValidationIssue>> {
        if (self.predicate)(candidate) {
            Ok(())
        } else {
            Err(vec![ValidationIssue {
                path: vec![],
                message: self.message.clone(),
            }])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicate_schema_reports_issue_on_failure() {
        let schema = PredicateSchema::new("id is required", |row: &Row| row.get("id").is_some());
        assert!(schema.validate(&json!({"id": 1}), ValidationKind::Insert).is_ok());
        assert!(schema.validate(&json!({}), ValidationKind::Insert).is_err());
    }
}
