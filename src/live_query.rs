//! Live-query glue (spec §4.7): wires every source collection named in a compiled [`Query`]
//! into its [`Graph`], and materializes the graph's output as its own [`Collection`] so a
//! live query composes like any other collection (including being a source for a further
//! live query).

use crate::collection::transaction::TransactionManager;
use crate::collection::{Change, ChangeType, Collection, CollectionConfig, SyncWrite};
use crate::dataflow::DfRow;
use crate::error::{CoreError, CoreResult};
use crate::query::compiler::{self, CompiledQuery};
use crate::query::ir::Query;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// A materialized live query: `collection` holds the current result set and emits changes
/// like any other collection as its sources change.
pub struct LiveQueryCollection {
    pub collection: Collection,
}

/// Tracks which sources have reached `Ready`/`InitialCommit` and buffers the deltas of the
/// ones that haven't, per spec §4.7: "graph runs are deferred until every source collection
/// is at least in ready/initialCommit status." A join computed against one loaded source and
/// one still-empty source would emit wrong (incomplete) rows, so every source's first batch
/// is held back until the whole set has reported in.
struct ReadinessGate {
    total_sources: usize,
    ready_sources: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, Vec<DfRow>>>,
}

impl ReadinessGate {
    fn all_ready(&self) -> bool {
        self.ready_sources.lock().len() >= self.total_sources
    }

    fn buffer(&self, alias: &str, batch: Vec<DfRow>) {
        self.pending.lock().entry(alias.to_string()).or_default().extend(batch);
    }

    /// Marks `alias` ready; once every source has, drains and runs whatever was buffered.
    /// Returns the drained batches when this call is the one that completes the set.
    fn mark_ready(&self, alias: &str) -> Option<HashMap<String, Vec<DfRow>>> {
        let newly_complete = {
            let mut ready = self.ready_sources.lock();
            ready.insert(alias.to_string());
            ready.len() >= self.total_sources
        };
        if !newly_complete {
            return None;
        }
        Some(std::mem::take(&mut *self.pending.lock()))
    }
}

/// Compiles `query`, subscribes to every aliased source in `sources`, and returns a
/// collection that stays incrementally up to date with the query's result. `sources` must
/// have an entry for every alias `query` references (its `from` and every `join`).
pub fn live_query_collection(
    id: impl Into<String>,
    query: &Query,
    sources: HashMap<String, Collection>,
    tx_manager: Arc<TransactionManager>,
) -> CoreResult<LiveQueryCollection> {
    let compiled = compiler::compile(query)?;
    for alias in compiled.inputs.keys() {
        if !sources.contains_key(alias) {
            return Err(CoreError::QueryCompile(format!(
                "live query references source alias '{alias}' with no collection supplied"
            )));
        }
    }

    let output = Collection::new(CollectionConfig::new(id, tx_manager));
    let graph = Arc::new(Mutex::new(compiled));
    let gate = Arc::new(ReadinessGate {
        total_sources: sources.len(),
        ready_sources: Mutex::new(HashSet::new()),
        pending: Mutex::new(HashMap::new()),
    });

    for (alias, source) in &sources {
        let sub_graph = graph.clone();
        let sub_output = output.clone();
        let sub_alias = alias.clone();
        let pushdown = graph.lock().pushdown.get(alias).cloned();
        let sub_gate = gate.clone();

        source.subscribe_changes(
            move |changes: &[Change]| {
                apply_source_changes(&sub_graph, &sub_alias, changes, &sub_output, &sub_gate);
            },
            true,
            pushdown,
        );
        // the unsubscribe handle is intentionally dropped: the live query lives as long as
        // `output` does, which owns no reference back to it, so there is nothing to leak
        // beyond the subscription itself living inside the source collection.

        let graph = graph.clone();
        let output = output.clone();
        let alias = alias.clone();
        let gate = gate.clone();
        source.on_first_commit(move || {
            let Some(pending) = gate.mark_ready(&alias) else {
                return;
            };
            // Every buffered alias's batch is run through the graph in a single step so a
            // join sees both sides' initial rows at once, instead of one alias's batch
            // landing against the other's still-empty state.
            if !run_and_commit(&graph, pending, &output) {
                let _ = output.begin();
                let _ = output.commit();
            }
        });
    }

    Ok(LiveQueryCollection { collection: output })
}

fn apply_source_changes(
    graph: &Arc<Mutex<CompiledQuery>>,
    alias: &str,
    changes: &[Change],
    output: &Collection,
    gate: &ReadinessGate,
) {
    let mut batch: Vec<DfRow> = Vec::with_capacity(changes.len() * 2);
    for change in changes {
        match change.change_type {
            ChangeType::Insert => batch.push((change.key.clone(), change.value.clone(), 1)),
            ChangeType::Delete => batch.push((change.key.clone(), change.value.clone(), -1)),
            ChangeType::Update => {
                if let Some(prev) = &change.previous_value {
                    batch.push((change.key.clone(), prev.clone(), -1));
                }
                batch.push((change.key.clone(), change.value.clone(), 1));
            }
        }
    }

    if !gate.all_ready() {
        gate.buffer(alias, batch);
        return;
    }
    let mut batches = HashMap::new();
    batches.insert(alias.to_string(), batch);
    run_and_commit(graph, batches, output);
}

/// Runs every aliased batch in `batches` through the graph in one step and commits any
/// resulting delta onto `output`. Returns whether it actually committed (a join's first
/// batch can legitimately produce no rows yet, in which case the caller decides whether
/// `output` still needs a status flip).
fn run_and_commit(graph: &Arc<Mutex<CompiledQuery>>, batches: HashMap<String, Vec<DfRow>>, output: &Collection) -> bool {
    let aliases: Vec<String> = batches.keys().cloned().collect();
    let mut guard = graph.lock();
    let mut inputs = HashMap::new();
    for (alias, batch) in batches {
        if let Some(id) = guard.inputs.get(&alias) {
            inputs.insert(*id, batch);
        }
    }
    let output_stage = guard.output;
    let result = guard.graph.run(&inputs);
    drop(guard);

    let delta = result.get(&output_stage).cloned().unwrap_or_default();
    trace!(?aliases, emitted = delta.len(), "live query recomputed");
    if delta.is_empty() {
        return false;
    }

    if output.begin().is_err() {
        return false;
    }
    for (key, row, multiplicity) in delta {
        let write = if multiplicity > 0 {
            SyncWrite::Upsert { key, value: row }
        } else {
            SyncWrite::Delete { key }
        };
        let _ = output.write(write);
    }
    let _ = output.commit();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionConfig;
    use crate::query::builder::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn live_query_tracks_a_where_push_down_over_a_single_source() {
        let tm = Arc::new(TransactionManager::default());
        let users = Collection::new(CollectionConfig::new("users", tm.clone()));

        let query = QueryBuilder::from_collection("users", "u")
            .filter(eq(prop("u", &["status"]), val(json!("active"))))
            .build();

        let mut sources = HashMap::new();
        sources.insert("u".to_string(), users.clone());
        let lq = live_query_collection("active_users", &query, sources, tm).unwrap();

        users.begin().unwrap();
        users
            .write(SyncWrite::Upsert {
                key: crate::value::Key::Number(1),
                value: json!({"status": "active", "name": "a"}),
            })
            .unwrap();
        users
            .write(SyncWrite::Upsert {
                key: crate::value::Key::Number(2),
                value: json!({"status": "archived", "name": "b"}),
            })
            .unwrap();
        users.commit().unwrap();

        assert_eq!(lq.collection.status(), crate::collection::CollectionStatus::Ready);
        assert_eq!(lq.collection.to_array().len(), 1);
        assert_eq!(lq.collection.to_array()[0]["name"], "a");
    }

    #[test]
    fn live_query_reacts_to_a_later_insert() {
        let tm = Arc::new(TransactionManager::default());
        let users = Collection::new(CollectionConfig::new("users", tm.clone()));
        users.begin().unwrap();
        users.commit().unwrap();

        let query = QueryBuilder::from_collection("users", "u").build();
        let mut sources = HashMap::new();
        sources.insert("u".to_string(), users.clone());
        let lq = live_query_collection("all_users", &query, sources, tm.clone()).unwrap();
        assert_eq!(lq.collection.to_array().len(), 0);

        let mutation_tx = tm.create_transaction(|_tx| async { Ok::<serde_json::Value, CoreError>(serde_json::Value::Null) });
        tm.with_active(&mutation_tx, || {
            users.insert(json!({"id": 1, "name": "new"})).unwrap();
        });
        assert_eq!(lq.collection.to_array().len(), 1);
    }

    /// A left join's first source committing alone must not run the graph against the other
    /// source's still-empty state -- that would emit a spurious "no match" row for an order
    /// that in fact has a matching user, just not loaded yet (spec §4.7's readiness gate).
    #[test]
    fn live_query_join_defers_until_every_source_is_ready() {
        use crate::query::ir::SourceRef;

        let tm = Arc::new(TransactionManager::default());
        let orders = Collection::new(CollectionConfig::new("orders", tm.clone()));
        let users = Collection::new(CollectionConfig::new("users", tm.clone()));

        let query = QueryBuilder::from_collection("orders", "o")
            .left_join(
                SourceRef::Collection("users".to_string()),
                "u",
                eq(prop("o", &["user_id"]), prop("u", &["id"])),
            )
            .build();

        let mut sources = HashMap::new();
        sources.insert("o".to_string(), orders.clone());
        sources.insert("u".to_string(), users.clone());
        let joined = live_query_collection("orders_with_users", &query, sources, tm.clone()).unwrap();

        orders.begin().unwrap();
        orders
            .write(SyncWrite::Upsert {
                key: crate::value::Key::Number(1),
                value: json!({"id": 1, "user_id": 1}),
            })
            .unwrap();
        orders.commit().unwrap();

        assert_eq!(joined.collection.status(), crate::collection::CollectionStatus::Idle);
        assert_eq!(joined.collection.to_array().len(), 0);

        users.begin().unwrap();
        users
            .write(SyncWrite::Upsert { key: crate::value::Key::Number(1), value: json!({"id": 1, "name": "a"}) })
            .unwrap();
        users.commit().unwrap();

        assert_eq!(joined.collection.status(), crate::collection::CollectionStatus::Ready);
        let rows = joined.collection.to_array();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["o"]["id"], 1);
        assert_eq!(rows[0]["u"]["name"], "a");
    }
}
