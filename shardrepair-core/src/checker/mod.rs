//! Invariant checker.
//!
//! Finds every follower collection whose shard placement deviates from the placement of its
//! leader collection, and classifies the deviation.
//!
//! ## Swap detection
//! A deviation outside of a running repair is only repairable when a single global relabeling of
//! server identities explains it, and that relabeling is a transposition of exactly two servers.
//! This models a concrete failure mode: two servers exchanged their roles for a whole sharing
//! group. Wider permutations and membership changes are rejected as unrepairable.
//!
//! ## Running repairs
//! When the durable repair marker is already set, a previous cycle was interrupted part way
//! through its moves. The placement is then legitimately not a relabeling of the leader's (a
//! replica may be parked on a third server), so the deviation is classified for resumption and
//! the remaining moves are derived shard by shard.


use std::collections::{BTreeMap, BTreeSet};

use crate::error::{RepairError, RepairResult};
use crate::models::{Collection, ServerId, Snapshot};
use crate::planner::requires_parking;

/// The deviation of one follower shard from its leader shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardDeviation {
    /// The position of the shard within the collection's shard order.
    pub index: usize,
    /// The follower shard's name.
    pub shard: String,
    /// The paired leader shard's name.
    pub leader_shard: String,
    /// The follower shard's current servers.
    pub current: Vec<ServerId>,
    /// The leader shard's servers, which the follower must mirror.
    pub target: Vec<ServerId>,
}

/// The classification of a follower collection's placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviationKind {
    /// The placement mirrors the leader.
    Consistent,
    /// Servers `a` and `b` exchanged roles across the collection.
    Swap { a: ServerId, b: ServerId },
    /// A repair was interrupted and must be resumed from the current placement.
    Resume,
}

/// A checked follower collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deviation {
    pub database: String,
    /// The follower collection's id.
    pub collection: String,
    pub collection_name: String,
    /// The leader reference exactly as stored on the follower.
    pub leader_reference: String,
    /// The resolved leader collection's id.
    pub leader: String,
    pub replication_factor: usize,
    /// True if the durable repair marker is set.
    pub repair_in_progress: bool,
    pub kind: DeviationKind,
    /// The shards which do not mirror their leader shard, in shard order.
    pub shards: Vec<ShardDeviation>,
}

impl Deviation {
    /// True if this deviation requires any repair operation.
    pub fn needs_repair(&self) -> bool {
        self.repair_in_progress || !matches!(self.kind, DeviationKind::Consistent)
    }
}

/// The check result of one follower collection.
#[derive(Debug)]
pub struct CollectionCheck {
    pub collection: String,
    pub collection_name: String,
    /// The id of the resolved leader collection, if any.
    pub leader: Option<String>,
    pub result: RepairResult<Deviation>,
}

/// Check every follower collection of the snapshot.
///
/// Checks are ordered so that every leader comes before the collections following it, followed
/// by malformed plan entries which declare a leader, reported as unrepairable.
pub fn check_snapshot(snapshot: &Snapshot) -> Vec<CollectionCheck> {
    let mut followers: Vec<&Collection> = snapshot.followers().collect();
    followers.sort_by_key(|follower| leader_depth(snapshot, follower));
    let mut checks: Vec<CollectionCheck> = followers
        .into_iter()
        .map(|follower| CollectionCheck {
            collection: follower.id.clone(),
            collection_name: follower.name.clone(),
            leader: follower
                .leader_reference()
                .and_then(|reference| snapshot.resolve_leader(reference))
                .map(|leader| leader.id.clone()),
            result: check_collection(snapshot, follower),
        })
        .collect();
    checks.extend(snapshot.malformed.iter().map(|(id, reason)| CollectionCheck {
        collection: id.clone(),
        collection_name: String::new(),
        leader: None,
        result: Err(RepairError::unrepairable(id, format!("malformed plan entry: {}", reason))),
    }));
    checks
}

/// The number of leader hops from a collection to the root of its sharing group.
pub fn leader_depth(snapshot: &Snapshot, collection: &Collection) -> usize {
    let mut seen = BTreeSet::new();
    let mut current = collection;
    seen.insert(current.id.as_str());
    while let Some(leader) = current.leader_reference().and_then(|reference| snapshot.resolve_leader(reference)) {
        if !seen.insert(leader.id.as_str()) {
            break;
        }
        current = leader;
    }
    seen.len() - 1
}

/// Check one follower collection against its leader.
#[tracing::instrument(level = "debug", skip(snapshot, follower), fields(collection = %follower.id))]
pub fn check_collection(snapshot: &Snapshot, follower: &Collection) -> RepairResult<Deviation> {
    let unrepairable = |reason: String| RepairError::unrepairable(&follower.id, reason);

    let leader_reference = match (&follower.distribute_shards_like, &follower.repair_distribute_shards_like) {
        (Some(_), Some(_)) => {
            return Err(unrepairable(
                "both distributeShardsLike and repairDistributeShardsLike are set".into(),
            ))
        }
        (Some(reference), None) | (None, Some(reference)) => reference.clone(),
        (None, None) => return Err(unrepairable("collection does not follow another collection".into())),
    };
    let leader = snapshot
        .resolve_leader(&leader_reference)
        .ok_or_else(|| unrepairable(format!("leader collection {} not found", leader_reference)))?;
    if leader.id == follower.id {
        return Err(unrepairable("collection follows itself".into()));
    }
    if leader.shards.len() != follower.shards.len() {
        return Err(unrepairable(format!(
            "follower has {} shards, leader {} has {}",
            follower.shards.len(),
            leader.id,
            leader.shards.len()
        )));
    }
    if leader.replication_factor != follower.replication_factor {
        return Err(unrepairable(format!(
            "follower replicationFactor {} differs from leader replicationFactor {}",
            follower.replication_factor, leader.replication_factor
        )));
    }

    let mut shards = vec![];
    for (index, (fshard, lshard)) in follower.shards.iter().zip(leader.shards.iter()).enumerate() {
        if fshard.servers.len() != lshard.servers.len() {
            return Err(unrepairable(format!(
                "shard {} has {} replicas, leader shard {} has {}",
                fshard.name,
                fshard.servers.len(),
                lshard.name,
                lshard.servers.len()
            )));
        }
        if has_duplicates(&lshard.servers) || has_duplicates(&fshard.servers) {
            return Err(unrepairable(format!("shard {} or {} lists a server twice", fshard.name, lshard.name)));
        }
        if fshard.servers != lshard.servers {
            shards.push(ShardDeviation {
                index,
                shard: fshard.name.clone(),
                leader_shard: lshard.name.clone(),
                current: fshard.servers.clone(),
                target: lshard.servers.clone(),
            });
        }
    }

    let repair_in_progress = follower.repair_in_progress();
    let kind = if shards.is_empty() {
        DeviationKind::Consistent
    } else if repair_in_progress {
        DeviationKind::Resume
    } else {
        let (a, b) = find_transposition(leader, follower).map_err(unrepairable)?;
        DeviationKind::Swap { a, b }
    };

    let deviation = Deviation {
        database: snapshot.database.clone(),
        collection: follower.id.clone(),
        collection_name: follower.name.clone(),
        leader_reference,
        leader: leader.id.clone(),
        replication_factor: follower.replication_factor,
        repair_in_progress,
        kind,
        shards,
    };
    check_health(snapshot, &deviation)?;
    tracing::debug!(kind = ?deviation.kind, affected = deviation.shards.len(), "collection checked");
    Ok(deviation)
}

/// Find the global relabeling σ with σ(leader placement) == follower placement, and require it
/// to be a transposition of exactly two servers.
fn find_transposition(leader: &Collection, follower: &Collection) -> Result<(ServerId, ServerId), String> {
    let mut sigma: BTreeMap<&ServerId, &ServerId> = BTreeMap::new();
    let mut inverse: BTreeMap<&ServerId, &ServerId> = BTreeMap::new();
    let pairs = leader
        .shards
        .iter()
        .zip(follower.shards.iter())
        .flat_map(|(lshard, fshard)| lshard.servers.iter().zip(fshard.servers.iter()));
    for (lserver, fserver) in pairs {
        if *sigma.entry(lserver).or_insert(fserver) != fserver {
            return Err(format!("server {} maps to more than one server, placement is not a relabeling", lserver));
        }
        if *inverse.entry(fserver).or_insert(lserver) != lserver {
            return Err(format!("server {} is the image of more than one server, placement is not a relabeling", fserver));
        }
    }

    let moved: Vec<(&ServerId, &ServerId)> = sigma.into_iter().filter(|(from, to)| from != to).collect();
    match moved.as_slice() {
        [(a, b), (c, d)] if a == d && b == c => Ok(((*a).clone(), (*b).clone())),
        _ => Err(format!(
            "placement differs by a relabeling of {} servers, only a swap of two servers is repairable",
            moved.len()
        )),
    }
}

/// Ensure enough GOOD servers exist to carry the repair, and that every server which has to
/// receive a replica is GOOD.
fn check_health(snapshot: &Snapshot, deviation: &Deviation) -> RepairResult<()> {
    let parking = deviation.shards.iter().any(|shard| requires_parking(&shard.current, &shard.target));
    let required = deviation.replication_factor + if parking { 1 } else { 0 };
    let available = snapshot.good_servers().len();
    if !deviation.shards.is_empty() && available < required {
        return Err(RepairError::InsufficientHealthyServers {
            collection: deviation.collection.clone(),
            required,
            available,
        });
    }

    for shard in deviation.shards.iter() {
        let receivers = shard
            .current
            .iter()
            .zip(shard.target.iter())
            .filter(|(cur, tgt)| cur != tgt)
            .map(|(_, tgt)| tgt);
        for server in receivers {
            if !snapshot.is_good(server) {
                return Err(RepairError::unrepairable(
                    &deviation.collection,
                    format!("server {} must receive a replica of shard {} but is not healthy", server, shard.shard),
                ));
            }
        }
    }
    Ok(())
}

fn has_duplicates(servers: &[ServerId]) -> bool {
    servers.iter().enumerate().any(|(idx, server)| servers[..idx].contains(server))
}
