//! Cluster topology data models.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

/// The stable identity of a server.
pub type ServerId = String;

/// The collection attribute declaring the collection whose shard placement must be mirrored.
pub const ATTR_DISTRIBUTE_SHARDS_LIKE: &str = "distributeShardsLike";
/// The collection attribute which replaces `distributeShardsLike` while a repair is in progress.
pub const ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE: &str = "repairDistributeShardsLike";

/// The health of a placement-eligible server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Good,
    Bad,
}

/// A shard of a collection along with its ordered server list.
///
/// The first server holds the leader replica, the remaining servers hold followers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Shard {
    pub name: String,
    pub servers: Vec<ServerId>,
}

impl Shard {
    /// The server holding this shard's leader replica, if any.
    pub fn leader(&self) -> Option<&ServerId> {
        self.servers.first()
    }
}

/// A collection as found in the plan of a database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Collection {
    /// The collection's id, unique within its database.
    pub id: String,
    pub name: String,
    pub replication_factor: usize,
    /// The leader collection reference, when the invariant is armed.
    pub distribute_shards_like: Option<String>,
    /// The leader collection reference, while a repair is in progress.
    pub repair_distribute_shards_like: Option<String>,
    /// Shards ordered by `shard_order`.
    pub shards: Vec<Shard>,
}

impl Collection {
    /// The leader collection reference of this collection, whether armed or under repair.
    pub fn leader_reference(&self) -> Option<&str> {
        self.distribute_shards_like
            .as_deref()
            .or_else(|| self.repair_distribute_shards_like.as_deref())
    }

    /// True if this collection follows the placement of another collection.
    pub fn is_follower(&self) -> bool {
        self.leader_reference().is_some()
    }

    /// True if the durable repair marker is set on this collection.
    pub fn repair_in_progress(&self) -> bool {
        self.repair_distribute_shards_like.is_some()
    }
}

/// An immutable view of one database's topology at one logical point in time.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Snapshot {
    /// The database this snapshot describes.
    pub database: String,
    /// All parsable collections of the database, keyed by id.
    pub collections: BTreeMap<String, Collection>,
    /// Health of all placement-eligible servers.
    pub health: BTreeMap<ServerId, HealthStatus>,
    /// Plan entries which could not be parsed, keyed by collection id, with the reason.
    pub malformed: BTreeMap<String, String>,
}

impl Snapshot {
    /// Resolve a `distributeShardsLike` reference, by id first and by name second.
    pub fn resolve_leader(&self, reference: &str) -> Option<&Collection> {
        self.collections
            .get(reference)
            .or_else(|| self.collections.values().find(|coll| coll.name == reference))
    }

    /// All collections which follow another collection's placement, in id order.
    pub fn followers(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values().filter(|coll| coll.is_follower())
    }

    /// True if the given server is known and GOOD.
    pub fn is_good(&self, server: &str) -> bool {
        matches!(self.health.get(server), Some(HealthStatus::Good))
    }

    /// All GOOD servers, sorted by id.
    pub fn good_servers(&self) -> Vec<&ServerId> {
        self.health
            .iter()
            .filter(|(_, status)| matches!(status, HealthStatus::Good))
            .map(|(id, _)| id)
            .collect()
    }
}

/// Order shard names by their numeric suffix, falling back to lexical order.
///
/// Shard `s9` sorts before `s10`. Names with a numeric suffix sort before all other names, which
/// are ordered lexically among themselves. The Nth shard of a follower pairs with the Nth shard of
/// its leader under this order.
pub fn shard_order(a: &str, b: &str) -> Ordering {
    match (numeric_suffix(a), numeric_suffix(b)) {
        (Some(na), Some(nb)) => na.cmp(&nb).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn numeric_suffix(name: &str) -> Option<u64> {
    let digits = name.trim_start_matches(|c: char| !c.is_ascii_digit());
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
