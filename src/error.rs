//! Crate-wide error taxonomy, following spec §7.
//!
//! Validation and protocol errors are returned to the immediate caller and never mutate
//! state; persistence errors are surfaced through [`crate::collection::transaction::Transaction`]
//! rather than this enum, since they must carry a live, queryable transaction handle.

use crate::query::ir::Expr;
use thiserror::Error;

/// A single schema validation issue, modeled on the Standard Schema `issues[]` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Insert,
    Update,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema validation failed for {kind:?}: {issues:?}")]
    SchemaValidation {
        kind: ValidationKind,
        issues: Vec<ValidationIssue>,
    },

    #[error("index evaluation failed: {0}")]
    IndexEvaluation(String),

    #[error("adapter protocol violation: {0}")]
    AdapterProtocol(String),

    #[error("optimiser produced a push-down candidate it could not lower: {0:?}")]
    OptimiserInvariant(Expr),

    #[error("no active transaction: mutation calls must happen inside Transaction::mutate")]
    NoActiveTransaction,

    #[error("key count ({given}) does not match item count ({expected})")]
    KeyCountMismatch { given: usize, expected: usize },

    #[error("invalid mutation argument: {0}")]
    InvalidArgument(String),

    #[error("no object in the batch produced any change")]
    NoOpMutation,

    #[error("collection is not ready: {0}")]
    NotReady(String),

    #[error("value is not JSON-encodable: {0}")]
    NotSerializable(String),

    #[error("timed out waiting for transaction id {0}")]
    Timeout(String),

    #[error("query compile error: {0}")]
    QueryCompile(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
