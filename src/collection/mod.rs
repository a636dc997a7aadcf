//! Collection runtime (spec §3, §4.6).
//!
//! Fuses authoritative synced state with a local optimistic overlay into one derived view,
//! drives change notifications for [`crate::live_query`] and direct subscribers, and owns the
//! collection's set of [`crate::index::Index`]es. The "pass the object in place of the key"
//! ergonomics the original offers via a weak object->key map have no counterpart here: Rust
//! rows are plain owned `Row` values with no stable identity to key a weak map on, so callers
//! always address mutations by [`Key`] directly (Design Notes' explicit-registry
//! re-architecture, simplified one step further since there is no ambient identity to track).

pub mod schema;
pub mod transaction;

use crate::change_tracker::{diff, is_empty_changeset, with_change_tracking};
use crate::error::{CoreError, CoreResult, ValidationKind};
use crate::index::{Index, IndexOp};
use crate::query::eval::eval_predicate;
use crate::query::ir::Expr;
use crate::value::{apply_changes, Key, Row};
use parking_lot::Mutex;
use schema::Schema;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace};
use transaction::{MutationType, PendingMutation, Transaction, TransactionManager};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    Idle,
    Loading,
    InitialCommit,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct Change {
    pub key: Key,
    pub change_type: ChangeType,
    pub value: Row,
    pub previous_value: Option<Row>,
}

/// How eagerly auto-created indexes are built; spec §4.1's `autoIndex` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoIndex {
    Eager,
    Off,
}

/// `{key?, metadata?}` per spec.md:110. `keys`, when non-empty, supplies explicit keys for
/// the leading rows of an `insert_many` call by position; any row beyond `keys.len()` falls
/// back to the collection's `get_key`.
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    pub keys: Vec<Key>,
    pub metadata: Option<Json>,
}

impl InsertOptions {
    pub fn with_key(key: Key) -> Self {
        InsertOptions { keys: vec![key], metadata: None }
    }
}

pub struct CollectionConfig {
    pub id: String,
    pub get_key: Arc<dyn Fn(&Row) -> Key + Send + Sync>,
    pub schema: Option<Arc<dyn Schema>>,
    pub auto_index: AutoIndex,
    pub transaction_manager: Arc<TransactionManager>,
}

impl CollectionConfig {
    pub fn new(id: impl Into<String>, transaction_manager: Arc<TransactionManager>) -> Self {
        CollectionConfig {
            id: id.into(),
            get_key: Arc::new(|row| Key::from_row_hash(row)),
            schema: None,
            auto_index: AutoIndex::Eager,
            transaction_manager,
        }
    }
}

type ChangeCallback = Box<dyn Fn(&[Change]) + Send + Sync>;

struct Subscription {
    id: u64,
    callback: ChangeCallback,
    where_expr: Option<Expr>,
}

struct Inner {
    id: String,
    get_key: Arc<dyn Fn(&Row) -> Key + Send + Sync>,
    schema: Option<Arc<dyn Schema>>,
    auto_index: AutoIndex,

    synced: HashMap<Key, Row>,
    derived: HashMap<Key, Row>,
    pending_mutations: Vec<PendingMutation>,

    indexes: HashMap<u64, Index>,
    next_index_id: u64,

    status: CollectionStatus,
    status_tx: watch::Sender<CollectionStatus>,
    seen_begin: bool,
    received_first_commit: bool,
    on_first_commit: Vec<Box<dyn FnOnce() + Send>>,

    subscriptions: Vec<Subscription>,
    next_sub_id: u64,
}

/// A live reference to a registered change subscription; dropping or calling
/// [`Unsubscribe::cancel`] removes it.
pub struct Unsubscribe {
    id: u64,
    collection: Arc<Mutex<Inner>>,
}

impl Unsubscribe {
    pub fn cancel(self) {
        self.collection.lock().subscriptions.retain(|s| s.id != self.id);
    }
}

/// The reactive collection runtime. Cloning shares the same underlying state (spec's
/// single shared collection instance per `id`).
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Mutex<Inner>>,
    tx_manager: Arc<TransactionManager>,
}

impl Collection {
    pub fn new(config: CollectionConfig) -> Self {
        let (status_tx, _rx) = watch::channel(CollectionStatus::Idle);
        let tx_manager = config.transaction_manager.clone();
        Collection {
            inner: Arc::new(Mutex::new(Inner {
                id: config.id,
                get_key: config.get_key,
                schema: config.schema,
                auto_index: config.auto_index,
                synced: HashMap::new(),
                derived: HashMap::new(),
                pending_mutations: Vec::new(),
                indexes: HashMap::new(),
                next_index_id: 0,
                status: CollectionStatus::Idle,
                status_tx,
                seen_begin: false,
                received_first_commit: false,
                on_first_commit: Vec::new(),
                subscriptions: Vec::new(),
                next_sub_id: 0,
            })),
            tx_manager,
        }
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn status(&self) -> CollectionStatus {
        self.inner.lock().status
    }

    /// Broadcast channel of status transitions, the supplemented observability hook named in
    /// SPEC_FULL §3 (the original exposes status only through a synchronous getter).
    pub fn status_changes(&self) -> watch::Receiver<CollectionStatus> {
        self.inner.lock().status_tx.subscribe()
    }

    pub async fn state_when_ready(&self) -> HashMap<Key, Row> {
        self.wait_ready().await;
        self.state()
    }

    pub async fn to_array_when_ready(&self) -> Vec<Row> {
        self.wait_ready().await;
        self.to_array()
    }

    async fn wait_ready(&self) {
        let mut rx = self.status_changes();
        loop {
            if matches!(*rx.borrow(), CollectionStatus::Ready) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn state(&self) -> HashMap<Key, Row> {
        self.inner.lock().derived.clone()
    }

    pub fn to_array(&self) -> Vec<Row> {
        self.inner.lock().derived.values().cloned().collect()
    }

    pub fn get(&self, key: &Key) -> Option<Row> {
        self.inner.lock().derived.get(key).cloned()
    }

    /// Snapshots the current derived state as a sequence of insert [`Change`]s, per spec
    /// §3's `currentStateAsChanges` (used to replay state to a newly attached subscriber that
    /// asked for `includeInitialState`).
    pub fn current_state_as_changes(&self) -> Vec<Change> {
        self.inner
            .lock()
            .derived
            .iter()
            .map(|(k, v)| Change {
                key: k.clone(),
                change_type: ChangeType::Insert,
                value: v.clone(),
                previous_value: None,
            })
            .collect()
    }

    pub fn on_first_commit(&self, cb: impl FnOnce() + Send + 'static) {
        let mut guard = self.inner.lock();
        if guard.received_first_commit {
            drop(guard);
            cb();
        } else {
            guard.on_first_commit.push(Box::new(cb));
        }
    }

    pub fn create_index(&self, path: Vec<String>, name: Option<String>) -> u64 {
        let mut guard = self.inner.lock();
        let id = guard.next_index_id;
        guard.next_index_id += 1;
        let name = name.unwrap_or_else(|| format!("auto_{}", path.join(".")));
        let mut index = Index::new(id, name, path);
        index.build(guard.derived.iter());
        guard.indexes.insert(id, index);
        id
    }

    fn auto_index_for(guard: &mut Inner, path: &[String]) -> u64 {
        if let Some((id, _)) = guard.indexes.iter().find(|(_, idx)| idx.matches_field(path)) {
            return *id;
        }
        let id = guard.next_index_id;
        guard.next_index_id += 1;
        let mut index = Index::new(id, format!("auto_{}", path.join(".")), path.to_vec());
        index.build(guard.derived.iter());
        guard.indexes.insert(id, index);
        id
    }

    /// Registers a live subscription. When `where_expr` is a single-alias, index-shaped
    /// clause (`eq`/`gt`/`gte`/`lt`/`lte`/`in` against a `Prop`), an index is looked up (or,
    /// under [`AutoIndex::Eager`], created) and used to pre-filter the initial snapshot rather
    /// than scanning every row -- spec §4.4's push-down optimisation surfacing at the
    /// collection boundary.
    pub fn subscribe_changes(
        &self,
        callback: impl Fn(&[Change]) + Send + Sync + 'static,
        include_initial_state: bool,
        where_expr: Option<Expr>,
    ) -> Unsubscribe {
        let mut guard = self.inner.lock();
        if include_initial_state {
            let initial = index_filtered_snapshot(&mut guard, where_expr.as_ref());
            if !initial.is_empty() {
                callback(&initial);
            }
        }
        let id = guard.next_sub_id;
        guard.next_sub_id += 1;
        guard.subscriptions.push(Subscription {
            id,
            callback: Box::new(callback),
            where_expr,
        });
        Unsubscribe {
            id,
            collection: self.inner.clone(),
        }
    }

    // ---- Sync channel protocol (spec §6) ----

    pub fn begin(&self) -> CoreResult<()> {
        let mut guard = self.inner.lock();
        if guard.seen_begin {
            return Err(CoreError::AdapterProtocol("begin() called twice without an intervening commit()".into()));
        }
        guard.seen_begin = true;
        if matches!(guard.status, CollectionStatus::Idle) {
            guard.status = CollectionStatus::Loading;
            let _ = guard.status_tx.send(CollectionStatus::Loading);
        }
        trace!(collection = %guard.id, "sync begin");
        Ok(())
    }

    pub fn write(&self, op: SyncWrite) -> CoreResult<()> {
        let mut guard = self.inner.lock();
        if !guard.seen_begin {
            return Err(CoreError::AdapterProtocol("write() called before begin()".into()));
        }
        apply_synced_write(&mut guard, op);
        Ok(())
    }

    pub fn commit(&self) -> CoreResult<()> {
        let (ran_callbacks, status_after) = {
            let mut guard = self.inner.lock();
            if !guard.seen_begin {
                return Err(CoreError::AdapterProtocol("commit() called before begin()".into()));
            }
            guard.seen_begin = false;
            let was_first = !guard.received_first_commit;
            guard.received_first_commit = true;
            guard.status = CollectionStatus::Ready;
            let _ = guard.status_tx.send(CollectionStatus::Ready);
            let callbacks = if was_first {
                std::mem::take(&mut guard.on_first_commit)
            } else {
                Vec::new()
            };
            (callbacks, guard.status)
        };
        for cb in ran_callbacks {
            cb();
        }
        debug!(status = ?status_after, "sync commit");
        Ok(())
    }

    // ---- Mutations (spec §4.5) ----

    pub fn insert(&self, row: Row) -> CoreResult<Transaction> {
        self.insert_many(vec![row], InsertOptions::default())
    }

    /// Single-row insert with an explicit key and/or metadata (spec.md:110's `{key?,
    /// metadata?}`).
    pub fn insert_with(&self, row: Row, options: InsertOptions) -> CoreResult<Transaction> {
        self.insert_many(vec![row], options)
    }

    /// Inserts every row in `rows`, in order. `options.keys`, if non-empty, supplies the key
    /// for the rows at the same index instead of the collection's `get_key`; per spec.md:110
    /// ("throws if more keys than items are given") it is an error to supply more keys than
    /// rows, but supplying fewer is fine -- the remaining rows fall back to `get_key`.
    pub fn insert_many(&self, rows: Vec<Row>, options: InsertOptions) -> CoreResult<Transaction> {
        if rows.is_empty() {
            return Err(CoreError::InvalidArgument("insert requires at least one row".into()));
        }
        if options.keys.len() > rows.len() {
            return Err(CoreError::KeyCountMismatch { given: options.keys.len(), expected: rows.len() });
        }
        let guard = self.inner.lock();
        if let Some(schema) = &guard.schema {
            for row in &rows {
                schema
                    .validate(row, ValidationKind::Insert)
                    .map_err(|issues| CoreError::SchemaValidation { kind: ValidationKind::Insert, issues })?;
            }
        }
        let get_key = guard.get_key.clone();
        drop(guard);

        let tx = self.target_transaction()?;
        let metadata = options.metadata.unwrap_or(Json::Null);
        let mut keys = Vec::with_capacity(rows.len());
        self.tx_manager.with_active(&tx, || {
            for (i, row) in rows.into_iter().enumerate() {
                let key = options.keys.get(i).cloned().unwrap_or_else(|| get_key(&row));
                keys.push(key.clone());
                tx.record(PendingMutation {
                    id: Uuid::new_v4().to_string(),
                    mutation_type: MutationType::Insert,
                    key,
                    original: Json::Null,
                    modified: row.clone(),
                    changes: diff(&Json::Null, &row),
                    metadata: metadata.clone(),
                    sync_metadata: Json::Null,
                    created_at: std::time::Instant::now(),
                    updated_at: std::time::Instant::now(),
                });
            }
        });
        self.recompute_from(&tx, &keys);
        Ok(tx)
    }

    pub fn update(&self, key: Key, mutate: impl FnOnce(&mut Row)) -> CoreResult<Transaction> {
        let tx = self.target_transaction_for(&key)?;
        let base = self.current_base_for(&key, &tx);
        let current = self.derived_value(&key).unwrap_or_else(|| base.clone());

        let delta = with_change_tracking(&current, mutate);
        if is_empty_changeset(&delta) {
            return Err(CoreError::NoOpMutation);
        }
        let new_full = apply_changes(&current, &delta);
        let final_changes = diff(&base, &new_full);

        {
            let guard = self.inner.lock();
            if let Some(schema) = &guard.schema {
                schema
                    .validate(&new_full, ValidationKind::Update)
                    .map_err(|issues| CoreError::SchemaValidation { kind: ValidationKind::Update, issues })?;
            }
        }

        if is_empty_changeset(&final_changes) {
            // net no-op against the transaction's original base: drop any stale pending
            // mutation this key already had and reconcile derived state back to it.
            tx.drop_mutation(&key);
            self.recompute_from(&tx, std::slice::from_ref(&key));
            return Err(CoreError::NoOpMutation);
        }

        self.tx_manager.with_active(&tx, || {
            tx.record(PendingMutation {
                id: Uuid::new_v4().to_string(),
                mutation_type: MutationType::Update,
                key: key.clone(),
                original: base,
                modified: new_full,
                changes: final_changes,
                metadata: Json::Null,
                sync_metadata: Json::Null,
                created_at: std::time::Instant::now(),
                updated_at: std::time::Instant::now(),
            });
        });
        self.recompute_from(&tx, std::slice::from_ref(&key));
        Ok(tx)
    }

    pub fn delete(&self, key: Key) -> CoreResult<Transaction> {
        let tx = self.target_transaction_for(&key)?;
        let base = self.current_base_for(&key, &tx);
        self.tx_manager.with_active(&tx, || {
            tx.record(PendingMutation {
                id: Uuid::new_v4().to_string(),
                mutation_type: MutationType::Delete,
                key: key.clone(),
                original: base,
                modified: Json::Null,
                changes: serde_json::json!({"_deleted": true}),
                metadata: Json::Null,
                sync_metadata: Json::Null,
                created_at: std::time::Instant::now(),
                updated_at: std::time::Instant::now(),
            });
        });
        self.recompute_from(&tx, std::slice::from_ref(&key));
        Ok(tx)
    }

    /// Resolves the transaction a mutation call outside an explicit target should join.
    /// Per spec.md:95, `getActiveTransaction()` outside `mutate` is undefined and "mutation
    /// calls throw" -- so a bare `collection.insert(...)` with no active transaction is a
    /// caller error, not a case to paper over with a synthesized no-op transaction.
    fn target_transaction(&self) -> CoreResult<Transaction> {
        transaction::active_transaction().ok_or(CoreError::NoActiveTransaction)
    }

    fn target_transaction_for(&self, _key: &Key) -> CoreResult<Transaction> {
        transaction::active_transaction().ok_or(CoreError::NoActiveTransaction)
    }

    /// The value a mutation's diff should be computed against: the existing pending
    /// mutation's original for this key within `tx` if one exists (so repeated edits inside
    /// one transaction coalesce against the transaction's original base, not each other's
    /// intermediate value), else the current synced value, else `Null` for a fresh key.
    fn current_base_for(&self, key: &Key, tx: &Transaction) -> Row {
        if let Some(existing) = tx.mutations().into_iter().find(|m| &m.key == key) {
            return existing.original;
        }
        self.inner.lock().synced.get(key).cloned().unwrap_or(Json::Null)
    }

    fn derived_value(&self, key: &Key) -> Option<Row> {
        self.inner.lock().derived.get(key).cloned()
    }

    /// Recomputes derived state for `keys` and emits the resulting changes; called eagerly
    /// after each mutation call so subscribers observe the optimistic overlay immediately,
    /// per spec §3's "always reflects the fused view". `keys` names exactly the keys this
    /// call touched rather than deriving them from `tx.mutations()`, since a net-no-op update
    /// coalesces its own entry out of the transaction -- the collection still needs to drop
    /// its stale copy of that key's pending mutation in that case.
    fn recompute_from(&self, tx: &Transaction, keys: &[Key]) {
        let tx_muts = tx.mutations();
        let mut guard = self.inner.lock();
        for key in keys {
            guard.pending_mutations.retain(|m| &m.key != key);
            if let Some(m) = tx_muts.iter().find(|m| &m.key == key) {
                guard.pending_mutations.push(m.clone());
            }
        }
        for key in keys {
            recompute_key(&mut guard, key);
        }
    }

    pub fn dispose(&self) {
        let mut guard = self.inner.lock();
        guard.subscriptions.clear();
        guard.indexes.clear();
        guard.synced.clear();
        guard.derived.clear();
        guard.pending_mutations.clear();
        guard.status = CollectionStatus::Idle;
        let _ = guard.status_tx.send(CollectionStatus::Idle);
        info!(collection = %guard.id, "collection disposed");
    }
}

pub enum SyncWrite {
    Upsert { key: Key, value: Row },
    Delete { key: Key },
}

fn apply_synced_write(guard: &mut Inner, op: SyncWrite) {
    let key = match &op {
        SyncWrite::Upsert { key, .. } => key.clone(),
        SyncWrite::Delete { key } => key.clone(),
    };
    match op {
        SyncWrite::Upsert { key, value } => {
            guard.synced.insert(key, value);
        }
        SyncWrite::Delete { key } => {
            guard.synced.remove(&key);
        }
    }
    // drop any optimistic mutation for this key that the sync now confirms (spec §3's
    // optimistic/synced handoff: once the server value lands, the local overlay for that key
    // is no longer needed).
    guard.pending_mutations.retain(|m| m.key != key);
    recompute_key(guard, &key);
}

fn compute_derived(guard: &Inner, key: &Key) -> Option<Row> {
    let base = guard.synced.get(key).cloned();
    let mut current = base;
    for m in guard.pending_mutations.iter().filter(|m| &m.key == key) {
        current = match m.mutation_type {
            MutationType::Insert | MutationType::Update => Some(m.modified.clone()),
            MutationType::Delete => None,
        };
    }
    current
}

fn recompute_key(guard: &mut Inner, key: &Key) {
    let new_value = compute_derived(guard, key);
    let old_value = guard.derived.get(key).cloned();

    let change = match (&old_value, &new_value) {
        (None, Some(v)) => Some(Change {
            key: key.clone(),
            change_type: ChangeType::Insert,
            value: v.clone(),
            previous_value: None,
        }),
        (Some(o), Some(v)) if o != v => Some(Change {
            key: key.clone(),
            change_type: ChangeType::Update,
            value: v.clone(),
            previous_value: Some(o.clone()),
        }),
        (Some(o), None) => Some(Change {
            key: key.clone(),
            change_type: ChangeType::Delete,
            value: o.clone(),
            previous_value: Some(o.clone()),
        }),
        _ => None,
    };

    let Some(change) = change else { return };

    for index in guard.indexes.values_mut() {
        match (&old_value, &new_value) {
            (None, Some(v)) => index.add(key.clone(), v),
            (Some(o), Some(v)) => index.update(key, o, v),
            (Some(o), None) => index.remove(key, o),
            (None, None) => {}
        }
    }

    match &new_value {
        Some(v) => {
            guard.derived.insert(key.clone(), v.clone());
        }
        None => {
            guard.derived.remove(key);
        }
    }

    notify(guard, &change);
}

/// `subscribe_changes`'s `whereExpression` is built the same way a query's `WHERE` is (via
/// [`crate::query::builder::prop`]), which addresses rows through a source alias. A bare
/// collection subscription has no join to wrap rows for, so this wraps the raw row under
/// whichever single alias the expression references before evaluating it.
fn eval_where(expr: &Expr, row: &Row) -> bool {
    let mut aliases = Vec::new();
    crate::query::ir::referenced_aliases(expr, &mut aliases);
    match aliases.into_iter().next() {
        Some(alias) => {
            let wrapped = serde_json::json!({ alias: row });
            eval_predicate(expr, &wrapped)
        }
        None => eval_predicate(expr, row),
    }
}

fn notify(guard: &Inner, change: &Change) {
    for sub in &guard.subscriptions {
        let matches = match &sub.where_expr {
            None => true,
            Some(expr) => eval_where(expr, &change.value),
        };
        if matches {
            (sub.callback)(std::slice::from_ref(change));
        }
    }
}

/// Builds the initial snapshot for a new subscription, using an index lookup when
/// `where_expr` is a single pushable clause and [`AutoIndex::Eager`] allows materializing one
/// on demand, else falling back to a full scan filtered in-process.
fn index_filtered_snapshot(guard: &mut Inner, where_expr: Option<&Expr>) -> Vec<Change> {
    let Some(expr) = where_expr else {
        return guard
            .derived
            .iter()
            .map(|(k, v)| Change {
                key: k.clone(),
                change_type: ChangeType::Insert,
                value: v.clone(),
                previous_value: None,
            })
            .collect();
    };

    if let Some((path, op, value)) = as_index_clause(expr) {
        if guard.auto_index == AutoIndex::Eager {
            let id = Collection::auto_index_for(guard, &path);
            if let Some(index) = guard.indexes.get_mut(&id) {
                let keys = index.lookup(op, &value);
                return keys
                    .into_iter()
                    .filter_map(|k| guard.derived.get(&k).map(|v| (k, v.clone())))
                    .map(|(k, v)| Change {
                        key: k,
                        change_type: ChangeType::Insert,
                        value: v,
                        previous_value: None,
                    })
                    .collect();
            }
        }
    }

    guard
        .derived
        .iter()
        .filter(|(_, v)| eval_where(expr, v))
        .map(|(k, v)| Change {
            key: k.clone(),
            change_type: ChangeType::Insert,
            value: v.clone(),
            previous_value: None,
        })
        .collect()
}

fn as_index_clause(expr: &Expr) -> Option<(Vec<String>, IndexOp, Json)> {
    match expr {
        Expr::Func(name, args) if args.len() == 2 => {
            let op = match name.as_str() {
                "eq" => IndexOp::Eq,
                "gt" => IndexOp::Gt,
                "gte" => IndexOp::Gte,
                "lt" => IndexOp::Lt,
                "lte" => IndexOp::Lte,
                "in" => IndexOp::In,
                _ => return None,
            };
            match (&args[0], &args[1]) {
                (Expr::Prop(_, path), Expr::Value(v)) => Some((path.clone(), op, v.clone())),
                (Expr::Value(v), Expr::Prop(_, path)) => Some((path.clone(), op, v.clone())),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_collection() -> (Collection, Arc<TransactionManager>) {
        let tm = Arc::new(TransactionManager::default());
        (Collection::new(CollectionConfig::new("todos", tm.clone())), tm)
    }

    /// Runs `f` inside a freshly created transaction, standing in for `tx.mutate(f)` -- every
    /// mutation call in these tests needs an active transaction per spec.md:95's throw
    /// contract.
    fn in_a_transaction<T>(tm: &TransactionManager, f: impl FnOnce() -> T) -> T {
        let tx = tm.create_transaction(|_tx| async { Ok::<Json, CoreError>(Json::Null) });
        tm.with_active(&tx, f)
    }

    #[test]
    fn sync_insert_then_up_to_date() {
        let (c, _tm) = test_collection();
        c.begin().unwrap();
        c.write(SyncWrite::Upsert {
            key: Key::Number(1),
            value: json!({"id": 1, "title": "a"}),
        })
        .unwrap();
        c.commit().unwrap();
        assert_eq!(c.status(), CollectionStatus::Ready);
        assert_eq!(c.to_array().len(), 1);
    }

    #[test]
    fn write_without_begin_is_a_protocol_error() {
        let (c, _tm) = test_collection();
        let err = c.write(SyncWrite::Upsert { key: Key::Number(1), value: json!({}) });
        assert!(matches!(err, Err(CoreError::AdapterProtocol(_))));
    }

    #[test]
    fn insert_outside_a_transaction_throws() {
        let (c, _tm) = test_collection();
        let err = c.insert(json!({"id": 1, "title": "draft"}));
        assert!(matches!(err, Err(CoreError::NoActiveTransaction)));
    }

    #[test]
    fn insert_many_with_more_keys_than_rows_throws() {
        let (c, tm) = test_collection();
        let err = in_a_transaction(&tm, || {
            c.insert_many(vec![json!({"id": 1})], InsertOptions { keys: vec![Key::Number(1), Key::Number(2)], metadata: None })
        });
        assert!(matches!(err, Err(CoreError::KeyCountMismatch { given: 2, expected: 1 })));
    }

    #[test]
    fn optimistic_insert_is_visible_before_confirmation() {
        let (c, tm) = test_collection();
        in_a_transaction(&tm, || {
            c.insert(json!({"id": 1, "title": "draft"})).unwrap();
        });
        assert_eq!(c.to_array().len(), 1);
    }

    #[test]
    fn update_coalesces_to_a_single_net_delta() {
        let (c, tm) = test_collection();
        c.begin().unwrap();
        c.write(SyncWrite::Upsert { key: Key::Number(1), value: json!({"id": 1, "v": "orig"}) }).unwrap();
        c.commit().unwrap();

        let tx = tm.create_transaction(|_tx| async { Ok::<Json, CoreError>(Json::Null) });
        tm.with_active(&tx, || {
            c.update(Key::Number(1), |row| row["v"] = json!("a")).unwrap();
            c.update(Key::Number(1), |row| row["v"] = json!("b")).unwrap();
        });
        let muts = tx.mutations();
        assert_eq!(muts.len(), 1);
        assert_eq!(muts[0].changes, json!({"v": "b"}));
    }

    #[test]
    fn subscribe_changes_with_where_filters_notifications() {
        let (c, tm) = test_collection();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _unsub = c.subscribe_changes(
            move |changes| {
                seen2.lock().extend(changes.iter().map(|c| c.value.clone()));
            },
            false,
            Some(crate::query::builder::eq(
                crate::query::builder::prop("_", &["status"]),
                crate::query::builder::val(json!("active")),
            )),
        );
        in_a_transaction(&tm, || {
            c.insert(json!({"id": 1, "status": "active"})).unwrap();
            c.insert(json!({"id": 2, "status": "archived"})).unwrap();
        });
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn delete_removes_from_derived_state() {
        let (c, tm) = test_collection();
        c.begin().unwrap();
        c.write(SyncWrite::Upsert { key: Key::Number(1), value: json!({"id": 1}) }).unwrap();
        c.commit().unwrap();
        in_a_transaction(&tm, || {
            c.delete(Key::Number(1)).unwrap();
        });
        assert!(c.get(&Key::Number(1)).is_none());
    }
}
