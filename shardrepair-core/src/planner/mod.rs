//! Move-plan generator.
//!
//! Turns a classified deviation into the ordered operations which restore the placement
//! invariant of a follower collection:
//!
//! 1. a guard transaction marking the repair as in progress (unless already marked),
//! 2. the MoveShard steps of every affected shard, in shard order,
//! 3. a guard transaction marking the repair as finished.
//!
//! ## Per-shard derivation
//! A MoveShard replaces the replica at one position of a shard's server list, and a server may
//! hold at most one replica of a shard. Steps are derived by repeatedly picking, in position
//! order:
//!
//! - a position whose target server holds no replica yet and whose current server is not needed
//!   anywhere else (a plain install);
//! - otherwise a position whose target server holds no replica yet (an install which vacates a
//!   server needed elsewhere, e.g. moving the leader replica onto its correct server);
//! - otherwise every mismatched position waits for a server still holding another replica, so the
//!   blocking replica is parked on a free healthy server ("make room").
//!
//! For two swapped servers A and B of a shard this yields exactly the rotation
//! make room (B → free), move leader (A → B), restore (free → A). Every step moves exactly one
//! replica, so a shard never has fewer than `replicationFactor - 1` replicas in sync. Because
//! derivation only looks at current vs. target placement, a partially executed rotation resumes
//! with just its remaining steps.

#[cfg(test)]
mod mod_test;

use crate::checker::{Deviation, DeviationKind, ShardDeviation};
use crate::error::{RepairError, RepairResult};
use crate::models::{ServerId, Snapshot};
use crate::operations::{MoveShardOperation, RepairOperation, RepairPlan};
use crate::transactions::{begin_repair_guard, finish_repair_guard};

/// A single replica relocation within one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardStep {
    /// The position within the shard's server list which is replaced.
    pub position: usize,
    pub from: ServerId,
    pub to: ServerId,
    /// True if this step parks a replica on a free server to make room.
    pub parking: bool,
}

impl ShardStep {
    /// True if this step relocates the shard's leader replica.
    pub fn is_leader(&self) -> bool {
        self.position == 0
    }
}

/// Derive the steps which turn `current` into `target`.
///
/// `pick_free` is asked for a server to park a replica on, given the placement at that point; it
/// must return a server holding no replica of the shard and not part of `target`. Returns `None`
/// if no free server could be found or the placement can not converge.
pub fn derive_shard_steps<F>(current: &[ServerId], target: &[ServerId], mut pick_free: F) -> Option<Vec<ShardStep>>
where
    F: FnMut(&[ServerId]) -> Option<ServerId>,
{
    if current.len() != target.len() {
        return None;
    }
    let mut placement = current.to_vec();
    let mut steps: Vec<ShardStep> = vec![];
    let limit = 3 * target.len();
    while placement != target {
        if steps.len() >= limit {
            return None;
        }
        let mismatched: Vec<usize> = (0..target.len()).filter(|idx| placement[*idx] != target[*idx]).collect();
        let installable = |idx: &&usize| !placement.contains(&target[**idx]);
        let install = mismatched
            .iter()
            .filter(installable)
            .find(|idx| !target.contains(&placement[**idx]))
            .or_else(|| mismatched.iter().find(installable))
            .copied();

        let step = match install {
            Some(position) => ShardStep {
                position,
                from: placement[position].clone(),
                to: target[position].clone(),
                parking: false,
            },
            None => {
                let wanted = &target[*mismatched.first()?];
                let position = placement.iter().position(|server| server == wanted)?;
                let free = pick_free(&placement).filter(|free| !placement.contains(free) && !target.contains(free))?;
                ShardStep {
                    position,
                    from: placement[position].clone(),
                    to: free,
                    parking: true,
                }
            }
        };
        placement[step.position] = step.to.clone();
        steps.push(step);
    }
    Some(steps)
}

/// True if turning `current` into `target` requires parking a replica on a free server.
pub fn requires_parking(current: &[ServerId], target: &[ServerId]) -> bool {
    let mut parked = 0usize;
    let steps = derive_shard_steps(current, target, |_| {
        parked += 1;
        Some(format!("\u{0}parking-{}", parked))
    });
    steps.map(|steps| steps.iter().any(|step| step.parking)).unwrap_or(false)
}

/// Build the repair plan of a checked collection.
///
/// Returns `None` for a consistent collection with no repair in progress.
#[tracing::instrument(level = "debug", skip(snapshot, deviation), fields(collection = %deviation.collection))]
pub fn plan_repair(snapshot: &Snapshot, deviation: &Deviation) -> RepairResult<Option<RepairPlan>> {
    if !deviation.needs_repair() {
        return Ok(None);
    }
    if let DeviationKind::Swap { a, b } = &deviation.kind {
        tracing::info!(a = %a, b = %b, shards = deviation.shards.len(), "planning swap repair");
    } else if deviation.repair_in_progress {
        tracing::info!(shards = deviation.shards.len(), "resuming interrupted repair");
    }

    let (database, collection) = (deviation.database.as_str(), deviation.collection.as_str());
    let mut operations = vec![];
    if !deviation.repair_in_progress {
        operations.push(RepairOperation::GuardTransaction(begin_repair_guard(
            database,
            collection,
            &deviation.leader_reference,
        )));
    }
    for shard in deviation.shards.iter() {
        let steps = plan_shard(snapshot, deviation, shard)?;
        operations.extend(steps.into_iter().map(|step| {
            RepairOperation::MoveShard(MoveShardOperation {
                database: database.to_string(),
                collection: collection.to_string(),
                shard: shard.shard.clone(),
                is_leader: step.is_leader(),
                from: step.from,
                to: step.to,
            })
        }));
    }
    operations.push(RepairOperation::GuardTransaction(finish_repair_guard(
        database,
        collection,
        &deviation.leader_reference,
    )));

    Ok(Some(RepairPlan {
        database: database.to_string(),
        collection: collection.to_string(),
        collection_name: deviation.collection_name.clone(),
        leader: deviation.leader.clone(),
        operations,
    }))
}

/// Derive the steps of one shard, parking replicas on the first free GOOD server by id.
fn plan_shard(snapshot: &Snapshot, deviation: &Deviation, shard: &ShardDeviation) -> RepairResult<Vec<ShardStep>> {
    let good = snapshot.good_servers();
    let pick_free = |placement: &[ServerId]| {
        good.iter()
            .find(|server| !placement.contains(**server) && !shard.target.contains(**server))
            .map(|server| (*server).clone())
    };
    match derive_shard_steps(&shard.current, &shard.target, pick_free) {
        Some(steps) => Ok(steps),
        None if requires_parking(&shard.current, &shard.target) => Err(RepairError::InsufficientHealthyServers {
            collection: deviation.collection.clone(),
            required: deviation.replication_factor + 1,
            available: good.len(),
        }),
        None => Err(RepairError::unrepairable(
            &deviation.collection,
            format!("no move sequence turns shard {} from {:?} into {:?}", shard.shard, shard.current, shard.target),
        )),
    }
}
