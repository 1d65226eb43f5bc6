//! Detection, planning & execution of `distributeShardsLike` placement repairs.
//!
//! A follower collection declares a leader collection via `distributeShardsLike`, and every one
//! of its shards must be placed on exactly the servers of the paired leader shard. This crate
//! reads a topology snapshot from the coordination store, finds followers whose placement
//! drifted, derives the minimal safe sequence of guard transactions & shard moves restoring the
//! invariant, and executes that sequence.

pub mod agency;
pub mod checker;
pub mod cycle;
pub mod error;
pub mod executor;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod operations;
pub mod planner;
pub mod prom;
pub mod relocation;
pub mod snapshot;
pub mod transactions;

pub use cycle::{CollectionOutcome, CollectionReport, CycleReport, RepairCycle};
pub use error::{AgencyError, RepairError, RepairResult};
pub use executor::{ExecutionSummary, Executor, RepairOptions};
