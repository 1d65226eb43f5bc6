//! Topology snapshot reader.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::agency::{plan_collections_path, AgencyClient, SUPERVISION_HEALTH};
use crate::error::{RepairError, RepairResult};
use crate::models::{shard_order, Collection, HealthStatus, Shard, Snapshot, ATTR_DISTRIBUTE_SHARDS_LIKE, ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE};

/// The server id prefix used by coordinators, which never hold shards.
const COORDINATOR_PREFIX: &str = "CRDN-";
/// Health record roles which are not placement targets.
const NON_PLACEMENT_ROLES: &[&str] = &["Coordinator", "Agent", "Single"];
/// The health status string of a healthy server.
const STATUS_GOOD: &str = "GOOD";

/// The raw plan entry of a collection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanCollection {
    name: String,
    #[serde(default)]
    shards: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    replication_factor: Option<Value>,
    #[serde(default)]
    distribute_shards_like: Option<String>,
    #[serde(default)]
    repair_distribute_shards_like: Option<String>,
}

/// The raw health record of a server.
#[derive(Debug, Default, Deserialize)]
struct HealthRecord {
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "Role", default)]
    role: Option<String>,
}

/// Read a fresh topology snapshot of the given database.
#[tracing::instrument(level = "debug", skip(agency))]
pub async fn read_snapshot(agency: &dyn AgencyClient, database: &str) -> RepairResult<Snapshot> {
    let plan = agency
        .read(&plan_collections_path(database))
        .await
        .map_err(RepairError::SnapshotUnavailable)?;
    let health = agency.read(SUPERVISION_HEALTH).await.map_err(RepairError::SnapshotUnavailable)?;
    if plan.is_none() {
        tracing::warn!(database, "no plan found for database, treating it as empty");
    }
    let snapshot = parse_snapshot(database, plan.as_ref(), health.as_ref());
    tracing::debug!(
        database,
        collections = snapshot.collections.len(),
        servers = snapshot.health.len(),
        malformed = snapshot.malformed.len(),
        "topology snapshot read"
    );
    Ok(snapshot)
}

/// Build a snapshot from the plan collections subtree and the supervision health subtree.
///
/// Malformed collections are recorded rather than failing the whole snapshot, so that one broken
/// plan entry never blocks the repair of others.
pub fn parse_snapshot(database: &str, plan: Option<&Value>, health: Option<&Value>) -> Snapshot {
    let mut snapshot = Snapshot {
        database: database.to_string(),
        ..Default::default()
    };

    if let Some(entries) = plan.and_then(Value::as_object) {
        for (id, raw) in entries {
            match parse_collection(id, raw) {
                Ok(collection) => {
                    snapshot.collections.insert(id.clone(), collection);
                }
                Err(reason) => {
                    tracing::warn!(database, collection = %id, %reason, "skipping malformed plan entry");
                    if declares_leader(raw) {
                        snapshot.malformed.insert(id.clone(), reason);
                    }
                }
            }
        }
    }

    if let Some(entries) = health.and_then(Value::as_object) {
        for (server, raw) in entries {
            if let Some(status) = parse_health(server, raw) {
                snapshot.health.insert(server.clone(), status);
            }
        }
    }

    snapshot
}

fn parse_collection(id: &str, raw: &Value) -> Result<Collection, String> {
    let plan: PlanCollection = serde_json::from_value(raw.clone()).map_err(|err| err.to_string())?;
    let replication_factor = match &plan.replication_factor {
        None => 1,
        Some(Value::Number(num)) => num
            .as_u64()
            .filter(|rf| *rf > 0)
            .ok_or_else(|| format!("invalid replicationFactor {}", num))? as usize,
        Some(other) => return Err(format!("unsupported replicationFactor {}", other)),
    };
    let mut shards: Vec<Shard> = plan
        .shards
        .into_iter()
        .map(|(name, servers)| Shard { name, servers })
        .collect();
    shards.sort_by(|a, b| shard_order(&a.name, &b.name));

    Ok(Collection {
        id: id.to_string(),
        name: plan.name,
        replication_factor,
        distribute_shards_like: plan.distribute_shards_like,
        repair_distribute_shards_like: plan.repair_distribute_shards_like,
        shards,
    })
}

fn declares_leader(raw: &Value) -> bool {
    [ATTR_DISTRIBUTE_SHARDS_LIKE, ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE]
        .iter()
        .any(|attr| raw.get(*attr).is_some())
}

/// Parse a health record, returning `None` for servers which are never placement targets.
fn parse_health(server: &str, raw: &Value) -> Option<HealthStatus> {
    if server.starts_with(COORDINATOR_PREFIX) {
        return None;
    }
    let record: HealthRecord = serde_json::from_value(raw.clone()).unwrap_or_default();
    if record.role.as_deref().map(|role| NON_PLACEMENT_ROLES.contains(&role)).unwrap_or(false) {
        return None;
    }
    match record.status.as_deref() {
        Some(STATUS_GOOD) => Some(HealthStatus::Good),
        Some(_) => Some(HealthStatus::Bad),
        None => None,
    }
}
