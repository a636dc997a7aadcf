//! A client-side reactive collection and live-query engine: synced state fused with a local
//! optimistic overlay, and standing queries incrementally maintained over an in-memory
//! differential dataflow.
//!
//! The three tightly coupled pieces are [`collection`] (the synced/optimistic fused view and
//! its sync channel), [`collection::transaction`] (the transaction lifecycle that produces
//! and confirms optimistic mutations), and [`live_query`] (materializing a [`query`] as a
//! collection that stays incrementally up to date). [`dataflow`] is the incremental execution
//! substrate the compiled queries run on; [`index`] backs both the dataflow's WHERE push-down
//! and direct `subscribe_changes` filtering.

pub mod adapters;
pub mod change_tracker;
pub mod collection;
pub mod consolidation;
pub mod dataflow;
pub mod error;
pub mod index;
pub mod live_query;
pub mod query;
pub mod value;

pub use collection::{Change, ChangeType, Collection, CollectionConfig, CollectionStatus, SyncWrite};
pub use collection::transaction::{PendingMutation, Transaction, TransactionManager, TransactionState};
pub use error::{CoreError, CoreResult};
pub use live_query::{live_query_collection, LiveQueryCollection};
pub use value::{Key, Row};
