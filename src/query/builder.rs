//! Chainable, immutable query builder (spec §4.4 "Builder").
//!
//! Each method consumes `self` and returns a new builder wrapping a new [`Query`], matching
//! the spec's "each method returns a new builder with a new IR" contract; there is no shared
//! mutable draft underneath.

use super::ir::{Join, JoinType, OrderByEntry, Query, Select, SourceRef};
use crate::query::ir::Expr;
use crate::value::Row;
use serde_json::Value as Json;
use std::sync::Arc;

// --- expression constructors (the "ref proxy" replacement, per Design Notes) ---

pub fn prop(alias: &str, path: &[&str]) -> Expr {
    Expr::Prop(alias.to_string(), path.iter().map(|s| s.to_string()).collect())
}

pub fn val(v: impl Into<Json>) -> Expr {
    Expr::Value(v.into())
}

macro_rules! func2 {
    ($name:ident, $tag:literal) => {
        pub fn $name(a: Expr, b: Expr) -> Expr {
            Expr::Func($tag.to_string(), vec![a, b])
        }
    };
}
func2!(eq, "eq");
func2!(gt, "gt");
func2!(gte, "gte");
func2!(lt, "lt");
func2!(lte, "lte");
func2!(add, "add");
func2!(like, "like");
func2!(ilike, "ilike");
func2!(concat, "concat");

pub fn and(exprs: Vec<Expr>) -> Expr {
    Expr::Func("and".to_string(), exprs)
}
pub fn or(exprs: Vec<Expr>) -> Expr {
    Expr::Func("or".to_string(), exprs)
}
pub fn not(a: Expr) -> Expr {
    Expr::Func("not".to_string(), vec![a])
}
pub fn in_(a: Expr, values: Expr) -> Expr {
    Expr::Func("in".to_string(), vec![a, values])
}
pub fn upper(a: Expr) -> Expr {
    Expr::Func("upper".to_string(), vec![a])
}
pub fn lower(a: Expr) -> Expr {
    Expr::Func("lower".to_string(), vec![a])
}
pub fn length(a: Expr) -> Expr {
    Expr::Func("length".to_string(), vec![a])
}
pub fn coalesce(exprs: Vec<Expr>) -> Expr {
    Expr::Func("coalesce".to_string(), exprs)
}

pub fn count() -> Expr {
    Expr::Aggregate("count".to_string(), vec![])
}
pub fn avg(a: Expr) -> Expr {
    Expr::Aggregate("avg".to_string(), vec![a])
}
pub fn sum(a: Expr) -> Expr {
    Expr::Aggregate("sum".to_string(), vec![a])
}
pub fn min(a: Expr) -> Expr {
    Expr::Aggregate("min".to_string(), vec![a])
}
pub fn max(a: Expr) -> Expr {
    Expr::Aggregate("max".to_string(), vec![a])
}

pub fn fn_where(f: impl Fn(&Row) -> bool + Send + Sync + 'static) -> Expr {
    Expr::RawPredicate(Arc::new(f))
}

// --- builder ---

#[derive(Clone)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn from_collection(name: &str, alias: &str) -> Self {
        QueryBuilder {
            query: Query::new(SourceRef::Collection(name.to_string()), alias),
        }
    }

    pub fn from_subquery(sub: Query, alias: &str) -> Self {
        QueryBuilder {
            query: Query::new(SourceRef::Subquery(Box::new(sub)), alias),
        }
    }

    fn join_inner(mut self, join_type: JoinType, source: SourceRef, alias: &str, on: Expr) -> Self {
        self.query.joins.push(Join {
            join_type,
            source,
            alias: alias.to_string(),
            on,
        });
        self
    }

    pub fn join(self, source: SourceRef, alias: &str, on: Expr) -> Self {
        self.join_inner(JoinType::Inner, source, alias, on)
    }
    pub fn inner_join(self, source: SourceRef, alias: &str, on: Expr) -> Self {
        self.join_inner(JoinType::Inner, source, alias, on)
    }
    pub fn left_join(self, source: SourceRef, alias: &str, on: Expr) -> Self {
        self.join_inner(JoinType::Left, source, alias, on)
    }
    pub fn right_join(self, source: SourceRef, alias: &str, on: Expr) -> Self {
        self.join_inner(JoinType::Right, source, alias, on)
    }
    pub fn full_join(self, source: SourceRef, alias: &str, on: Expr) -> Self {
        self.join_inner(JoinType::Full, source, alias, on)
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.query.wheres.push(expr);
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.query.having.push(expr);
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.query.group_by = exprs;
        self
    }

    pub fn order_by(mut self, expr: Expr, descending: bool) -> Self {
        self.query.order_by.push(OrderByEntry { expr, descending });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.query.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.query.offset = n;
        self
    }

    /// Structural select; superseded by a later `select_fn` call, per spec §4.4.
    pub fn select(mut self, map: Vec<(&str, Expr)>) -> Self {
        self.query.select = Some(Select::Map(
            map.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        ));
        self
    }

    pub fn select_fn(mut self, f: impl Fn(&Row) -> Row + Send + Sync + 'static) -> Self {
        self.query.select = Some(Select::Func(Arc::new(f)));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.query.distinct = true;
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}
