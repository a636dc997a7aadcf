//! Transaction manager (spec §4.5).
//!
//! `Tx`'s "a live reference to a Tx always reads the current fields, never a snapshot" is
//! satisfied directly by `Transaction` being a cheap handle around `Arc<Mutex<Inner>>`: every
//! clone shares the same lock, so reading a field after `persist()` completes elsewhere
//! always observes the latest state -- no separate "refresh" step needed, which is exactly
//! the Design Notes' "explicit handles with getter methods" re-architecture of the original
//! proxy-backed live reference.

use crate::error::CoreError;
use crate::value::{Key, Row};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: String,
    pub mutation_type: MutationType,
    pub key: Key,
    pub original: Row,
    pub modified: Row,
    pub changes: Row,
    pub metadata: Json,
    pub sync_metadata: Json,
    pub created_at: Instant,
    pub updated_at: Instant,
}

/// Replaces any existing mutation for `new.key` (per spec §4.5 coalescing), or appends.
/// Returns `true` if a mutation for the key remains in `mutations` after the call.
pub fn coalesce_into(mutations: &mut Vec<PendingMutation>, new: PendingMutation) -> bool {
    if let Some(pos) = mutations.iter().position(|m| m.key == new.key) {
        mutations[pos] = new;
    } else {
        mutations.push(new);
    }
    true
}

/// Drops the mutation for `key` if present; used when a merged update nets to a no-op
/// against the mutation's original value.
pub fn drop_mutation(mutations: &mut Vec<PendingMutation>, key: &Key) {
    mutations.retain(|m| &m.key != key);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Persisting,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransactionFailure {
    pub message: String,
}

type MutationFn = Arc<
    dyn Fn(Transaction) -> Pin<Box<dyn Future<Output = Result<Json, CoreError>> + Send>> + Send + Sync,
>;

struct Inner {
    id: String,
    state: TransactionState,
    created_at: Instant,
    updated_at: Instant,
    mutations: Vec<PendingMutation>,
    metadata: Json,
    error: Option<TransactionFailure>,
    mutation_fn: Option<MutationFn>,
    result_tx: watch::Sender<Option<Result<Json, TransactionFailure>>>,
}

/// A handle to a transaction. Cloning is cheap and every clone observes live state, per the
/// spec's "live reference" contract.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Mutex<Inner>>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Transaction {
    fn new(mutation_fn: Option<MutationFn>) -> Self {
        let (tx, _rx) = watch::channel(None);
        let now = Instant::now();
        Transaction {
            inner: Arc::new(Mutex::new(Inner {
                id: Uuid::new_v4().to_string(),
                state: TransactionState::Pending,
                created_at: now,
                updated_at: now,
                mutations: Vec::new(),
                metadata: Json::Null,
                error: None,
                mutation_fn,
                result_tx: tx,
            })),
        }
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn created_at(&self) -> Instant {
        self.inner.lock().created_at
    }

    pub fn mutations(&self) -> Vec<PendingMutation> {
        self.inner.lock().mutations.clone()
    }

    /// Drops any pending mutation for `key`, used when an update call nets to a no-op
    /// against the transaction's original base value for that key.
    pub fn drop_mutation(&self, key: &Key) {
        let mut guard = self.inner.lock();
        drop_mutation(&mut guard.mutations, key);
        guard.updated_at = Instant::now();
    }

    pub fn error(&self) -> Option<TransactionFailure> {
        self.inner.lock().error.clone()
    }

    pub fn record(&self, mutation: PendingMutation) {
        let mut guard = self.inner.lock();
        let key = mutation.key.clone();
        if crate::change_tracker::is_empty_changeset(&mutation.changes) && mutation.mutation_type == MutationType::Update {
            drop_mutation(&mut guard.mutations, &key);
        } else {
            coalesce_into(&mut guard.mutations, mutation);
        }
        guard.updated_at = Instant::now();
    }

    /// Runs the user's `mutationFn` with a live handle to this transaction. Non-`Error`
    /// payloads aren't representable in Rust's `Result`, so the "wrap non-Error throws"
    /// clause of spec §4.5 has no counterpart here; any failure already carries a message.
    pub async fn persist(&self) -> Result<(), TransactionFailure> {
        let (mutation_fn, id) = {
            let mut guard = self.inner.lock();
            guard.state = TransactionState::Persisting;
            guard.updated_at = Instant::now();
            (guard.mutation_fn.clone(), guard.id.clone())
        };
        debug!(tx = %id, "transaction persisting");

        let Some(mutation_fn) = mutation_fn else {
            let failure = TransactionFailure {
                message: "transaction has no mutationFn".to_string(),
            };
            self.fail(failure.clone());
            return Err(failure);
        };

        match mutation_fn(self.clone()).await {
            Ok(_) => {
                let mut guard = self.inner.lock();
                guard.state = TransactionState::Completed;
                guard.updated_at = Instant::now();
                let _ = guard.result_tx.send(Some(Ok(Json::Null)));
                info!(tx = %id, "transaction completed");
                Ok(())
            }
            Err(e) => {
                let failure = TransactionFailure { message: e.to_string() };
                self.fail(failure.clone());
                Err(failure)
            }
        }
    }

    fn fail(&self, failure: TransactionFailure) {
        let mut guard = self.inner.lock();
        guard.state = TransactionState::Failed;
        guard.error = Some(failure.clone());
        guard.updated_at = Instant::now();
        let _ = guard.result_tx.send(Some(Err(failure.clone())));
        warn!(tx = %guard.id, error = %failure.message, "transaction failed");
    }

    /// Resolves once `persist()` settles; rejects (carries the failure) if it failed.
    /// The supplemented operation named in SPEC_FULL §3.
    pub async fn is_persisted(&self) -> Result<(), TransactionFailure> {
        let mut rx = self.inner.lock().result_tx.subscribe();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result.map(|_| ());
            }
            if rx.changed().await.is_err() {
                return Err(TransactionFailure {
                    message: "transaction handle dropped before settling".to_string(),
                });
            }
        }
    }

    /// Discards this transaction's optimistic overlay explicitly (SPEC_FULL §3); only valid
    /// once `Failed`, mirroring spec §7's "leave the optimistic overlay in place unless the
    /// caller rolls it back".
    pub fn rollback(&self) -> Vec<PendingMutation> {
        let mut guard = self.inner.lock();
        std::mem::take(&mut guard.mutations)
    }
}

thread_local! {
    static ACTIVE_TX: RefCell<Vec<Transaction>> = RefCell::new(Vec::new());
}

pub fn active_transaction() -> Option<Transaction> {
    ACTIVE_TX.with(|s| s.borrow().last().cloned())
}

fn push_active(tx: Transaction) {
    ACTIVE_TX.with(|s| s.borrow_mut().push(tx));
}
fn pop_active() {
    ACTIVE_TX.with(|s| {
        s.borrow_mut().pop();
    });
}

/// A queued callback representing a synced confirmation batch that arrived while some
/// transaction was persisting; flushed FIFO once no transaction is persisting (spec §4.5
/// "Optimistic/synced handoff").
type QueuedFlush = Box<dyn FnOnce() + Send>;

struct ManagerInner {
    pending: VecDeque<Transaction>,
    persisting_count: u64,
    queued: VecDeque<QueuedFlush>,
}

/// An explicit, app-owned coordinator shared by every collection that needs transactional
/// writes, replacing the original "global transaction-manager registry" with a plain field
/// per Design Notes.
pub struct TransactionManager {
    inner: Mutex<ManagerInner>,
    gc_time: Duration,
    seq: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TransactionManager {
    pub fn new(gc_time: Duration) -> Self {
        TransactionManager {
            inner: Mutex::new(ManagerInner {
                pending: VecDeque::new(),
                persisting_count: 0,
                queued: VecDeque::new(),
            }),
            gc_time,
            seq: AtomicU64::new(0),
        }
    }

    pub fn create_transaction<F, Fut>(&self, mutation_fn: F) -> Transaction
    where
        F: Fn(Transaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json, CoreError>> + Send + 'static,
    {
        let boxed: MutationFn = Arc::new(move |tx| Box::pin(mutation_fn(tx)));
        let tx = Transaction::new(Some(boxed));
        self.inner.lock().pending.push_back(tx.clone());
        tx
    }

    /// Runs `f` with `tx` set as the active transaction (spec §4.5's task-local notion of
    /// "active transaction"); mutation calls made inside `f` append to `tx`.
    pub fn with_active<R>(&self, tx: &Transaction, f: impl FnOnce() -> R) -> R {
        push_active(tx.clone());
        let result = f();
        pop_active();
        result
    }

    /// Either runs `flush` immediately (no transaction is persisting) or queues it to run
    /// FIFO once `persisting_count` returns to zero.
    pub fn run_or_queue_synced_flush(&self, flush: impl FnOnce() + Send + 'static) {
        let mut guard = self.inner.lock();
        if guard.persisting_count == 0 {
            drop(guard);
            flush();
        } else {
            guard.queued.push_back(Box::new(flush));
        }
    }

    pub fn begin_persisting(&self) {
        self.inner.lock().persisting_count += 1;
    }

    pub fn end_persisting(&self) {
        let mut drained = Vec::new();
        {
            let mut guard = self.inner.lock();
            guard.persisting_count = guard.persisting_count.saturating_sub(1);
            if guard.persisting_count == 0 {
                drained = guard.queued.drain(..).collect();
            }
        }
        for flush in drained {
            flush();
        }
    }

    /// Prunes terminal transactions older than `gc_time` (spec §5 resource policy).
    pub fn collect_garbage(&self, now: Instant) {
        let gc_time = self.gc_time;
        let mut guard = self.inner.lock();
        guard.pending.retain(|tx| {
            let state = tx.state();
            if matches!(state, TransactionState::Completed | TransactionState::Failed) {
                now.duration_since(tx.created_at()) < gc_time
            } else {
                true
            }
        });
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(key: Key, original: Json, modified: Json, changes: Json) -> PendingMutation {
        PendingMutation {
            id: Uuid::new_v4().to_string(),
            mutation_type: MutationType::Update,
            key,
            original,
            modified,
            changes,
            metadata: Json::Null,
            sync_metadata: Json::Null,
            created_at: Instant::now(),
            updated_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn mutation_coalescing_keeps_one_entry_per_key() {
        let tm = TransactionManager::default();
        let tx = tm.create_transaction(|_tx| async { Ok::<Json, CoreError>(Json::Null) });
        tm.with_active(&tx, || {
            tx.record(mutation(Key::Number(1), json!({"v": "orig"}), json!({"v": "a"}), json!({"v": "a"})));
            tx.record(mutation(Key::Number(1), json!({"v": "orig"}), json!({"v": "b"}), json!({"v": "b"})));
        });
        let muts = tx.mutations();
        assert_eq!(muts.len(), 1);
        assert_eq!(muts[0].changes, json!({"v": "b"}));
    }

    #[tokio::test]
    async fn persist_success_resolves_is_persisted() {
        let tm = TransactionManager::default();
        let tx = tm.create_transaction(|_tx| async { Ok::<Json, CoreError>(Json::Null) });
        tx.persist().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Completed);
        assert!(tx.is_persisted().await.is_ok());
    }

    #[tokio::test]
    async fn persist_failure_marks_failed_and_rejects() {
        let tm = TransactionManager::default();
        let tx = tm.create_transaction(|_tx| async {
            Err(CoreError::InvalidArgument("boom".to_string()))
        });
        let err = tx.persist().await;
        assert!(err.is_err());
        assert_eq!(tx.state(), TransactionState::Failed);
        assert!(tx.is_persisted().await.is_err());
    }

    #[test]
    fn no_active_transaction_outside_mutate() {
        assert!(active_transaction().is_none());

        use crate::collection::{Collection, CollectionConfig};
        use crate::error::CoreError;
        let tm = Arc::new(TransactionManager::default());
        let collection = Collection::new(CollectionConfig::new("todos", tm));
        let err = collection.insert(json!({"id": 1}));
        assert!(matches!(err, Err(CoreError::NoActiveTransaction)));
    }
}
