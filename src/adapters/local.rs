//! Local-only adapter: a collection with no external source of truth (spec §6, "local-only
//! collection type"). Every mutation is its own sync round-trip -- the optimistic value a
//! transaction produces simply becomes the synced value once that transaction persists,
//! rather than waiting on a server round trip.

use super::SyncAdapter;
use crate::collection::{Collection, SyncWrite};
use crate::collection::transaction::{PendingMutation, Transaction};
use crate::error::CoreResult;
use serde_json::Value as Json;
use std::future::Future;
use std::pin::Pin;

pub struct LocalOnlyAdapter;

impl SyncAdapter for LocalOnlyAdapter {
    fn run(&self, collection: Collection) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        Box::pin(async move {
            // no external source to wait on: the collection is ready the instant it's asked
            // to run, matching spec §6's "never produces a loading state" for local-only.
            collection.begin()?;
            collection.commit()?;
            Ok(())
        })
    }
}

/// Builds the `mutationFn` a local-only collection's transactions should use: committing a
/// transaction promotes every row it touched straight into synced truth on `collection`.
pub fn local_mutation_fn(
    collection: Collection,
) -> impl Fn(Transaction) -> Pin<Box<dyn Future<Output = Result<Json, crate::error::CoreError>> + Send>> {
    move |tx: Transaction| {
        let collection = collection.clone();
        Box::pin(async move {
            let mutations: Vec<PendingMutation> = tx.mutations();
            collection.begin()?;
            for m in &mutations {
                match m.mutation_type {
                    crate::collection::transaction::MutationType::Delete => {
                        collection.write(SyncWrite::Delete { key: m.key.clone() })?;
                    }
                    _ => {
                        collection.write(SyncWrite::Upsert {
                            key: m.key.clone(),
                            value: m.modified.clone(),
                        })?;
                    }
                }
            }
            collection.commit()?;
            Ok(Json::Null)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::transaction::TransactionManager;
    use crate::collection::CollectionConfig;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn local_only_mutation_promotes_straight_to_synced() {
        let tm = Arc::new(TransactionManager::default());
        let collection = Collection::new(CollectionConfig::new("notes", tm.clone()));
        let adapter = LocalOnlyAdapter;
        adapter.run(collection.clone()).await.unwrap();

        let mutation_fn = local_mutation_fn(collection.clone());
        let tx = tm.create_transaction(move |t| mutation_fn(t));
        tm.with_active(&tx, || {
            collection.insert(json!({"id": 1, "text": "hi"})).unwrap();
        });
        tx.persist().await.unwrap();
        assert_eq!(collection.to_array().len(), 1);
    }
}
