//! Sync adapters (spec §6): the external-facing half of the sync channel contract.
//!
//! [`crate::collection::Collection::begin`]/`write`/`commit` are the wire-level contract;
//! everything in this module is a concrete strategy for driving that contract from some
//! external data source, mirroring the adapter family spec §6 names (streaming, pull-query,
//! local-only). A browser `localStorage` adapter has no meaningful Rust counterpart -- there
//! is no shared-tab storage-event primitive outside a browser -- so it is not implemented
//! here; [`local::LocalOnlyAdapter`] covers the "no external source of truth" case a
//! server-side embedding actually needs.

pub mod local;
pub mod pull;
pub mod stream;

use crate::collection::Collection;
use crate::error::CoreResult;
use std::future::Future;
use std::pin::Pin;

/// Drives a [`Collection`]'s sync channel from some external source. `run` is expected to
/// run for the lifetime of the adapter (a streaming subscription, a polling loop); callers
/// spawn it on a `tokio` task.
pub trait SyncAdapter: Send + Sync {
    fn run(&self, collection: Collection) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>>;
}
