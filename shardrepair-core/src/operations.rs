//! Repair operation data models.
//!
//! A repair plan is a flat, ordered list of `RepairOperation`s. The order is part of the plan's
//! correctness and must be preserved by every consumer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single write operation on one key of the coordination store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum AgencyOperation {
    /// Remove the key.
    Delete { key: String },
    /// Set the key to the given value.
    Set { key: String, value: Value },
}

impl AgencyOperation {
    /// The key this operation applies to.
    pub fn key(&self) -> &str {
        match self {
            Self::Delete { key } | Self::Set { key, .. } => key,
        }
    }
}

/// A condition on one key of the coordination store which must hold for a write to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgencyPrecondition {
    /// The key must currently hold exactly the given value.
    Value { key: String, expected: Value },
    /// The key must not exist.
    Empty { key: String },
}

impl AgencyPrecondition {
    /// The key this precondition inspects.
    pub fn key(&self) -> &str {
        match self {
            Self::Value { key, .. } | Self::Empty { key } => key,
        }
    }
}

/// An atomic, conditional, multi-key write against the coordination store.
///
/// All operations are applied iff all preconditions hold.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgencyWriteTransaction {
    pub operations: Vec<AgencyOperation>,
    pub preconditions: Vec<AgencyPrecondition>,
}

/// The outcome of submitting a write transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All preconditions held and all operations were applied.
    Applied,
    /// At least one precondition did not hold; nothing was applied.
    PreconditionFailed,
}

/// Which end of a repair a guard transaction marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuardPhase {
    /// Rename `distributeShardsLike` to `repairDistributeShardsLike`.
    BeginRepair,
    /// Rename `repairDistributeShardsLike` back to `distributeShardsLike`.
    FinishRepair,
}

/// A guard transaction renaming the leader reference attribute of a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardTransaction {
    pub phase: GuardPhase,
    pub database: String,
    pub collection: String,
    /// The leader reference value carried across the rename.
    pub leader: String,
    pub transaction: AgencyWriteTransaction,
}

/// A directive to relocate one replica of a shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveShardOperation {
    pub database: String,
    pub collection: String,
    pub shard: String,
    pub from: String,
    pub to: String,
    /// True if `from` holds the shard's leader replica, i.e. this move changes leadership.
    pub is_leader: bool,
}

/// A planned unit of repair work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RepairOperation {
    GuardTransaction(GuardTransaction),
    MoveShard(MoveShardOperation),
}

impl RepairOperation {
    /// The move directive of this operation, if it is a move.
    pub fn as_move_shard(&self) -> Option<&MoveShardOperation> {
        match self {
            Self::MoveShard(op) => Some(op),
            Self::GuardTransaction(_) => None,
        }
    }
}

/// The ordered operations needed to repair one follower collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairPlan {
    pub database: String,
    pub collection: String,
    pub collection_name: String,
    pub leader: String,
    pub operations: Vec<RepairOperation>,
}

impl RepairPlan {
    /// The number of MoveShard steps in this plan.
    pub fn move_count(&self) -> usize {
        self.operations.iter().filter(|op| op.as_move_shard().is_some()).count()
    }
}
