//! Coordination store client abstractions.
//!
//! The repair machinery never talks to a concrete store. It is handed an `AgencyClient`, which
//! offers exactly the contract the repair algorithm depends upon: point reads of a key subtree
//! and atomic conditional multi-key writes.

#[cfg(test)]
mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgencyResult;
use crate::operations::{AgencyWriteTransaction, WriteOutcome};

#[cfg(test)]
pub use memory::InMemoryAgency;

/// The store subtree holding server health records.
pub const SUPERVISION_HEALTH: &str = "Supervision/Health";

/// A client of the coordination store.
#[async_trait]
pub trait AgencyClient: Send + Sync {
    /// Read the value stored under the given key path, `None` if the key does not exist.
    async fn read(&self, path: &str) -> AgencyResult<Option<Value>>;

    /// Submit an atomic conditional write.
    ///
    /// `Ok(WriteOutcome::PreconditionFailed)` means the store answered and rejected the whole
    /// transaction. An `Err` means the outcome is unknown; the write may or may not have applied.
    async fn write(&self, txn: &AgencyWriteTransaction) -> AgencyResult<WriteOutcome>;
}

/// The plan subtree of all collections of a database.
pub fn plan_collections_path(database: &str) -> String {
    format!("Plan/Collections/{}", database)
}

/// The plan entry of one collection.
pub fn plan_collection_path(database: &str, collection: &str) -> String {
    format!("Plan/Collections/{}/{}", database, collection)
}

/// One attribute of a collection's plan entry.
pub fn plan_collection_attr_path(database: &str, collection: &str, attr: &str) -> String {
    format!("Plan/Collections/{}/{}/{}", database, collection, attr)
}

/// The planned server list of one shard.
pub fn plan_shard_path(database: &str, collection: &str, shard: &str) -> String {
    format!("Plan/Collections/{}/{}/shards/{}", database, collection, shard)
}

/// Split a key path into its segments, ignoring leading, trailing & repeated slashes.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|seg| !seg.is_empty()).collect()
}

/// Look up the value under the given segments of a store tree.
pub fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |node, seg| node.as_object().and_then(|obj| obj.get(*seg)))
}
