//! Expression evaluation shared by the compiler (building `map`/`filter` closures) and by
//! [`crate::collection::Collection::subscribe_changes`]'s `whereExpression` filtering.

use super::ir::Expr;
use crate::value::{compare_json, get_path, Row};
use serde_json::Value as Json;
use std::cmp::Ordering;

fn eval_prop(ctx: &Row, alias: &str, path: &[String]) -> Json {
    match ctx.get(alias) {
        Some(root) => get_path(root, path).clone(),
        None => Json::Null,
    }
}

fn truthy(v: &Json) -> bool {
    matches!(v, Json::Bool(true))
}

fn as_f64(v: &Json) -> Option<f64> {
    v.as_f64()
}

fn as_str(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn like_to_regex_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    // SQL LIKE: '%' = any run, '_' = any single char.
    let (text, pattern) = if case_insensitive {
        (text.to_lowercase(), pattern.to_lowercase())
    } else {
        (text.to_string(), pattern.to_string())
    };
    like_match(text.as_bytes(), pattern.as_bytes())
}

fn like_match(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'%') => {
            like_match(text, &pattern[1..])
                || (!text.is_empty() && like_match(&text[1..], pattern))
        }
        Some(b'_') => !text.is_empty() && like_match(&text[1..], &pattern[1..]),
        Some(c) => !text.is_empty() && text[0] == *c && like_match(&text[1..], &pattern[1..]),
    }
}

pub fn eval_expr(expr: &Expr, ctx: &Row) -> Json {
    match expr {
        Expr::Prop(alias, path) => eval_prop(ctx, alias, path),
        Expr::Value(v) => v.clone(),
        Expr::Func(name, args) => eval_func(name, args, ctx),
        Expr::Aggregate(name, args) => eval_aggregate(name, args, ctx),
        Expr::RawPredicate(f) => Json::Bool(f(ctx)),
    }
}

pub fn eval_predicate(expr: &Expr, ctx: &Row) -> bool {
    truthy(&eval_expr(expr, ctx))
}

fn eval_func(name: &str, args: &[Expr], ctx: &Row) -> Json {
    match name {
        "eq" => Json::Bool(eval_expr(&args[0], ctx) == eval_expr(&args[1], ctx)),
        "gt" => Json::Bool(compare_json(&eval_expr(&args[0], ctx), &eval_expr(&args[1], ctx)) == Ordering::Greater),
        "gte" => {
            let c = compare_json(&eval_expr(&args[0], ctx), &eval_expr(&args[1], ctx));
            Json::Bool(c == Ordering::Greater || c == Ordering::Equal)
        }
        "lt" => Json::Bool(compare_json(&eval_expr(&args[0], ctx), &eval_expr(&args[1], ctx)) == Ordering::Less),
        "lte" => {
            let c = compare_json(&eval_expr(&args[0], ctx), &eval_expr(&args[1], ctx));
            Json::Bool(c == Ordering::Less || c == Ordering::Equal)
        }
        "and" => Json::Bool(args.iter().all(|a| truthy(&eval_expr(a, ctx)))),
        "or" => Json::Bool(args.iter().any(|a| truthy(&eval_expr(a, ctx)))),
        "not" => Json::Bool(!truthy(&eval_expr(&args[0], ctx))),
        "in" => {
            let needle = eval_expr(&args[0], ctx);
            let haystack = eval_expr(&args[1], ctx);
            let found = match haystack {
                Json::Array(items) => items.contains(&needle),
                _ => false,
            };
            Json::Bool(found)
        }
        "like" => Json::Bool(like_to_regex_match(
            &as_str(&eval_expr(&args[0], ctx)),
            &as_str(&eval_expr(&args[1], ctx)),
            false,
        )),
        "ilike" => Json::Bool(like_to_regex_match(
            &as_str(&eval_expr(&args[0], ctx)),
            &as_str(&eval_expr(&args[1], ctx)),
            true,
        )),
        "upper" => Json::String(as_str(&eval_expr(&args[0], ctx)).to_uppercase()),
        "lower" => Json::String(as_str(&eval_expr(&args[0], ctx)).to_lowercase()),
        "length" => {
            let v = eval_expr(&args[0], ctx);
            let len = match &v {
                Json::String(s) => s.chars().count(),
                Json::Array(a) => a.len(),
                Json::Null => 0,
                other => as_str(other).len(),
            };
            Json::Number(len.into())
        }
        "concat" => Json::String(args.iter().map(|a| as_str(&eval_expr(a, ctx))).collect()),
        "coalesce" => args
            .iter()
            .map(|a| eval_expr(a, ctx))
            .find(|v| !v.is_null())
            .unwrap_or(Json::Null),
        "add" => {
            let a = as_f64(&eval_expr(&args[0], ctx)).unwrap_or(0.0);
            let b = as_f64(&eval_expr(&args[1], ctx)).unwrap_or(0.0);
            serde_json::json!(a + b)
        }
        other => {
            tracing::warn!(func = other, "unknown query function, treating as null");
            Json::Null
        }
    }
}

fn group_rows(ctx: &Row) -> Vec<Row> {
    match ctx.get("__group_rows") {
        Some(Json::Array(items)) => items.clone(),
        _ => vec![],
    }
}

fn eval_aggregate(name: &str, args: &[Expr], ctx: &Row) -> Json {
    let members = group_rows(ctx);
    match name {
        "count" => Json::Number(members.len().into()),
        "sum" => {
            let total: f64 = members
                .iter()
                .filter_map(|m| as_f64(&eval_expr(&args[0], m)))
                .sum();
            serde_json::json!(total)
        }
        "avg" => {
            let values: Vec<f64> = members
                .iter()
                .filter_map(|m| as_f64(&eval_expr(&args[0], m)))
                .collect();
            if values.is_empty() {
                Json::Null
            } else {
                serde_json::json!(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        "min" => members
            .iter()
            .map(|m| eval_expr(&args[0], m))
            .min_by(compare_json)
            .unwrap_or(Json::Null),
        "max" => members
            .iter()
            .map(|m| eval_expr(&args[0], m))
            .max_by(compare_json)
            .unwrap_or(Json::Null),
        other => {
            tracing::warn!(agg = other, "unknown aggregate, treating as null");
            Json::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::*;
    use serde_json::json;

    #[test]
    fn eq_and_length_push_down_candidates() {
        let ctx = json!({"o": {"status": "active", "name": "alice"}});
        assert!(eval_predicate(&eq(prop("o", &["status"]), val(json!("active"))), &ctx));
        assert!(eval_predicate(&gt(length(prop("o", &["name"])), val(json!(4))), &ctx));
    }

    #[test]
    fn like_wildcards() {
        let ctx = json!({"o": {"name": "alice"}});
        assert!(eval_predicate(&like(prop("o", &["name"]), val(json!("al%"))), &ctx));
        assert!(!eval_predicate(&like(prop("o", &["name"]), val(json!("bob%"))), &ctx));
    }
}
