//! Pull-query adapter (spec §6): periodically re-fetches a full snapshot and diffs it
//! against what was last pushed into the collection, synthesizing a begin/write*/commit
//! cycle out of the diff. Used for sources with no native change feed (a plain REST
//! endpoint, a periodic batch export).

use super::SyncAdapter;
use crate::collection::{Collection, SyncWrite};
use crate::error::CoreResult;
use crate::value::{Key, Row};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

type PullFn = Box<dyn Fn() -> Pin<Box<dyn Future<Output = CoreResult<Vec<(Key, Row)>>> + Send>> + Send + Sync>;

pub struct PullAdapter {
    pull: PullFn,
    interval: Duration,
    last_snapshot: Mutex<HashMap<Key, Row>>,
}

impl PullAdapter {
    pub fn new<F, Fut>(interval: Duration, pull: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Vec<(Key, Row)>>> + Send + 'static,
    {
        PullAdapter {
            pull: Box::new(move || Box::pin(pull())),
            interval,
            last_snapshot: Mutex::new(HashMap::new()),
        }
    }

    async fn tick(&self, collection: &Collection) -> CoreResult<()> {
        let fresh: HashMap<Key, Row> = (self.pull)().await?.into_iter().collect();
        let mut last = self.last_snapshot.lock();

        collection.begin()?;
        for (key, value) in &fresh {
            if last.get(key) != Some(value) {
                collection.write(SyncWrite::Upsert { key: key.clone(), value: value.clone() })?;
            }
        }
        for key in last.keys() {
            if !fresh.contains_key(key) {
                collection.write(SyncWrite::Delete { key: key.clone() })?;
            }
        }
        collection.commit()?;

        debug!(rows = fresh.len(), "pull adapter reconciled snapshot");
        *last = fresh;
        Ok(())
    }
}

impl SyncAdapter for PullAdapter {
    fn run(&self, collection: Collection) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        Box::pin(async move {
            loop {
                self.tick(&collection).await?;
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::transaction::TransactionManager;
    use crate::collection::CollectionConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn reconciles_inserts_and_deletes_against_prior_snapshot() {
        let tm = Arc::new(TransactionManager::default());
        let collection = Collection::new(CollectionConfig::new("remote_users", tm));
        let call = Arc::new(AtomicUsize::new(0));
        let call2 = call.clone();

        let adapter = PullAdapter::new(Duration::from_secs(3600), move || {
            let call = call2.clone();
            async move {
                let n = call.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(vec![(Key::Number(1), json!({"id": 1, "name": "a"}))])
                } else {
                    Ok(vec![(Key::Number(2), json!({"id": 2, "name": "b"}))])
                }
            }
        });

        adapter.tick(&collection).await.unwrap();
        assert_eq!(collection.to_array().len(), 1);
        adapter.tick(&collection).await.unwrap();
        let rows = collection.to_array();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 2);
    }
}
