//! Query intermediate representation (spec §3, "Query IR `Q`").
//!
//! The "ref proxy" idiom from the original system (opaque objects whose property reads
//! produce `PropRef` nodes) becomes, per the Design Notes, a small set of tagged-variant
//! expression constructors plus free functions in [`crate::query::builder`] that build them
//! directly -- there is no proxy to interpose on in Rust, so callers write `eq(prop("o",
//! &["status"]), val(json!("active")))` instead of a JS arrow function over a proxy.

use crate::value::Row;
use serde_json::Value as Json;
use std::fmt;
use std::sync::Arc;

/// An expression tree node, used in `Where`, `Having`, `OrderBy`, and structural `Select`.
#[derive(Clone)]
pub enum Expr {
    /// A property path rooted at a source alias: `Prop("o", ["status"])` reads
    /// `row["o"]["status"]` once sources have been wrapped under their aliases.
    Prop(String, Vec<String>),
    Value(Json),
    Func(String, Vec<Expr>),
    Aggregate(String, Vec<Expr>),
    /// Opaque predicate escape hatch for `fn.where`/`fn.having` (spec §4.4's builder
    /// surface); never eligible for index push-down since the optimiser cannot see inside
    /// an arbitrary closure.
    RawPredicate(Arc<dyn Fn(&Row) -> bool + Send + Sync>),
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Prop(alias, path) => write!(f, "Prop({alias}, {path:?})"),
            Expr::Value(v) => write!(f, "Value({v})"),
            Expr::Func(name, args) => write!(f, "Func({name}, {args:?})"),
            Expr::Aggregate(name, args) => write!(f, "Aggregate({name}, {args:?})"),
            Expr::RawPredicate(_) => write!(f, "RawPredicate(..)"),
        }
    }
}

/// Walks `expr` collecting every distinct source alias it references.
pub fn referenced_aliases(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Prop(alias, _) => {
            if !out.contains(alias) {
                out.push(alias.clone());
            }
        }
        Expr::Func(_, args) | Expr::Aggregate(_, args) => {
            for a in args {
                referenced_aliases(a, out);
            }
        }
        Expr::Value(_) | Expr::RawPredicate(_) => {}
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Clone)]
pub enum SourceRef {
    Collection(String),
    Subquery(Box<Query>),
}

#[derive(Clone)]
pub struct From {
    pub source: SourceRef,
    pub alias: String,
}

#[derive(Clone)]
pub struct Join {
    pub join_type: JoinType,
    pub source: SourceRef,
    pub alias: String,
    pub on: Expr,
}

#[derive(Clone)]
pub struct OrderByEntry {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Clone)]
pub enum Select {
    Map(Vec<(String, Expr)>),
    Func(Arc<dyn Fn(&Row) -> Row + Send + Sync>),
}

#[derive(Clone)]
pub struct Query {
    pub from: From,
    pub joins: Vec<Join>,
    pub wheres: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    pub order_by: Vec<OrderByEntry>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub select: Option<Select>,
    pub distinct: bool,
}

impl Query {
    pub fn new(source: SourceRef, alias: impl Into<String>) -> Self {
        Query {
            from: From { source, alias: alias.into() },
            joins: Vec::new(),
            wheres: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            select: None,
            distinct: false,
        }
    }
}
