//! Query compiler and index optimiser (spec §4.4 "Compiler").
//!
//! Lowers a [`Query`] IR into a [`Graph`] pipeline, and performs the WHERE push-down
//! optimisation: single-source subclauses built only from `eq/gt/gte/lt/lte/in` (or
//! conjunctions/disjunctions of those) are pulled out of the dataflow and reported back as
//! per-alias [`Expr`]s so [`crate::collection::Collection::subscribe_changes`] can evaluate
//! them through a matching index instead of inside the pipeline.

use super::eval::{eval_expr, eval_predicate};
use super::ir::{From, Join, JoinType, Query, Select, SourceRef};
use crate::dataflow::{Graph, JoinKind};
use crate::error::{CoreError, CoreResult};
use crate::query::ir::Expr;
use crate::value::Row;
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;

pub struct CompiledQuery {
    pub graph: Graph,
    /// Alias -> stage id of that source's raw `Input` node (feed collection changes here).
    pub inputs: HashMap<String, usize>,
    pub output: usize,
    /// Alias -> expression to push down onto that source's `subscribe_changes` call.
    pub pushdown: HashMap<String, Expr>,
}

fn flatten_and(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Func(name, args) if name == "and" => {
            for a in args {
                flatten_and(a, out);
            }
        }
        other => out.push(other.clone()),
    }
}

fn single_alias(expr: &Expr) -> Option<String> {
    let mut aliases = Vec::new();
    super::ir::referenced_aliases(expr, &mut aliases);
    if aliases.len() == 1 {
        aliases.into_iter().next()
    } else {
        None
    }
}

fn is_pushable(expr: &Expr) -> bool {
    match expr {
        Expr::Func(name, args) => match name.as_str() {
            "eq" | "gt" | "gte" | "lt" | "lte" | "in" => {
                matches!(args[0], Expr::Prop(..)) || matches!(args[1], Expr::Prop(..))
            }
            "and" | "or" => args.iter().all(is_pushable),
            _ => false,
        },
        _ => false,
    }
}

/// Splits `wheres` into (dataflow-retained clauses, per-alias push-down expressions).
fn push_down(wheres: &[Expr]) -> (Vec<Expr>, HashMap<String, Expr>) {
    let mut subclauses = Vec::new();
    for w in wheres {
        flatten_and(w, &mut subclauses);
    }

    let mut retained = Vec::new();
    let mut pushed: HashMap<String, Expr> = HashMap::new();
    for clause in subclauses {
        match single_alias(&clause) {
            Some(alias) if is_pushable(&clause) => {
                pushed
                    .entry(alias)
                    .and_modify(|existing| {
                        *existing = Expr::Func("and".to_string(), vec![existing.clone(), clause.clone()]);
                    })
                    .or_insert(clause);
            }
            _ => retained.push(clause),
        }
    }
    (retained, pushed)
}

fn merge_wrapped(left: Option<&Row>, right: Option<&Row>) -> Row {
    let mut map = Map::new();
    if let Some(Json::Object(l)) = left {
        for (k, v) in l {
            map.insert(k.clone(), v.clone());
        }
    }
    match right {
        Some(Json::Object(r)) => {
            for (k, v) in r {
                map.insert(k.clone(), v.clone());
            }
        }
        None => {
            // null-complete: caller fills in only the side present via `left`/`right`, so
            // nothing to add here; downstream `Expr::Prop` reads on the missing alias
            // resolve to `Null` via `get_path`'s "missing segment" rule.
        }
        _ => {}
    }
    Json::Object(map)
}

struct Compiled {
    graph: Graph,
    inputs: HashMap<String, usize>,
}

fn compile_source(compiled: &mut Compiled, source: &SourceRef, alias: &str) -> CoreResult<usize> {
    match source {
        SourceRef::Collection(_name) => {
            let input = compiled.graph.add_input();
            compiled.inputs.insert(alias.to_string(), input);
            let alias_owned = alias.to_string();
            let wrapped = compiled.graph.add_map(input, move |row| {
                let mut map = Map::new();
                map.insert(alias_owned.clone(), row.clone());
                Json::Object(map)
            });
            Ok(wrapped)
        }
        SourceRef::Subquery(_) => Err(CoreError::QueryCompile(
            "subquery sources are not yet lowered into the parent graph".to_string(),
        )),
    }
}

fn join_key_fns(on: &Expr) -> CoreResult<(Expr, Expr)> {
    match on {
        Expr::Func(name, args) if name == "eq" && args.len() == 2 => Ok((args[0].clone(), args[1].clone())),
        other => Err(CoreError::QueryCompile(format!(
            "unsupported join condition, expected eq(a, b): {other:?}"
        ))),
    }
}

fn to_join_kind(jt: JoinType) -> JoinKind {
    match jt {
        JoinType::Inner => JoinKind::Inner,
        JoinType::Left => JoinKind::Left,
        JoinType::Right => JoinKind::Right,
        JoinType::Full => JoinKind::Full,
        JoinType::Cross => JoinKind::Cross,
    }
}

pub fn compile(query: &Query) -> CoreResult<CompiledQuery> {
    let mut compiled = Compiled {
        graph: Graph::new(),
        inputs: HashMap::new(),
    };

    let From { source, alias } = &query.from;
    let mut current = match source {
        SourceRef::Collection(_) => compile_source(&mut compiled, source, alias)?,
        SourceRef::Subquery(_) => return Err(CoreError::QueryCompile("nested subqueries unsupported".to_string())),
    };

    for Join { join_type, source, alias, on } in &query.joins {
        let right = compile_source(&mut compiled, source, alias)?;
        let (left_expr, right_expr) = join_key_fns(on)?;
        current = compiled.graph.add_join(
            to_join_kind(*join_type),
            current,
            right,
            move |row| eval_expr(&left_expr, row),
            move |row| eval_expr(&right_expr, row),
            merge_wrapped,
        );
    }

    let (retained_wheres, pushdown) = push_down(&query.wheres);
    for clause in &retained_wheres {
        let clause = clause.clone();
        current = compiled.graph.add_filter(current, move |row| eval_predicate(&clause, row));
    }

    if !query.group_by.is_empty() {
        let group_exprs = query.group_by.clone();
        let group_key_fn = move |row: &Row| -> Json {
            Json::Array(group_exprs.iter().map(|e| eval_expr(e, row)).collect())
        };
        let group_exprs_for_agg = query.group_by.clone();
        let aggregate = move |rows: &[Row]| -> Row {
            let mut map = Map::new();
            if let Some(first) = rows.first() {
                for (i, e) in group_exprs_for_agg.iter().enumerate() {
                    map.insert(format!("__group_{i}"), eval_expr(e, first));
                }
            }
            map.insert(
                "__group_rows".to_string(),
                Json::Array(rows.to_vec()),
            );
            Json::Object(map)
        };
        current = compiled.graph.add_reduce(current, group_key_fn, aggregate);

        for h in &query.having {
            let h = h.clone();
            current = compiled.graph.add_filter(current, move |row| eval_predicate(&h, row));
        }
    }

    if !query.order_by.is_empty() {
        let order_by = query.order_by.clone();
        let compare = move |a: &Row, b: &Row| {
            for entry in &order_by {
                let av = eval_expr(&entry.expr, a);
                let bv = eval_expr(&entry.expr, b);
                let mut c = crate::value::compare_json(&av, &bv);
                if entry.descending {
                    c = c.reverse();
                }
                if c != std::cmp::Ordering::Equal {
                    return c;
                }
            }
            std::cmp::Ordering::Equal
        };
        current = compiled.graph.add_topk(current, compare, query.limit, query.offset);
    } else {
        current = compiled.graph.add_consolidate(current);
    }

    if let Some(select) = &query.select {
        current = match select {
            Select::Map(fields) => {
                let fields = fields.clone();
                compiled.graph.add_map(current, move |row| {
                    let mut out = Map::new();
                    for (name, expr) in &fields {
                        out.insert(name.clone(), eval_expr(expr, row));
                    }
                    Json::Object(out)
                })
            }
            Select::Func(f) => {
                let f = Arc::clone(f);
                compiled.graph.add_map(current, move |row| f(row))
            }
        };
    } else if query.joins.is_empty() && query.group_by.is_empty() {
        // implicit "select *": a single, unjoined source's rows stay wrapped under their
        // alias (`compile_source` wraps every source so `Expr::Prop` reads resolve
        // uniformly); with no explicit projection there is nothing left that needs the
        // wrapper, so unwrap back to the bare row. Joined queries already produce a flat
        // merged row via `merge_wrapped`, so no unwrap is needed there.
        let alias = query.from.alias.clone();
        current = compiled.graph.add_map(current, move |row| row.get(&alias).cloned().unwrap_or(Json::Null));
    }

    if query.distinct {
        current = compiled.graph.add_distinct(current);
    }

    let output = compiled.graph.add_output(current);

    Ok(CompiledQuery {
        graph: compiled.graph,
        inputs: compiled.inputs,
        output,
        pushdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::*;
    use serde_json::json;
    use std::collections::HashMap as Map2;

    #[test]
    fn eq_pushes_down_length_stays_in_dataflow() {
        let q = QueryBuilder::from_collection("users", "o")
            .filter(and(vec![
                eq(prop("o", &["status"]), val(json!("active"))),
                gt(length(prop("o", &["name"])), val(json!(4))),
            ]))
            .build();
        let compiled = compile(&q).unwrap();
        assert!(compiled.pushdown.contains_key("o"));

        let mut inputs = Map2::new();
        inputs.insert(
            compiled.inputs["o"],
            vec![
                (crate::value::Key::Number(1), json!({"status": "active", "name": "alice"}), 1),
                (crate::value::Key::Number(2), json!({"status": "active", "name": "bo"}), 1),
            ],
        );
        let mut graph = compiled.graph;
        let result = graph.run(&inputs);
        // the length(...) > 4 clause must still be enforced inside the dataflow
        assert_eq!(result[&compiled.output].len(), 1);
    }
}
