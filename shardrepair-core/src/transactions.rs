//! Transaction builder.
//!
//! Translates plan steps into conditional coordination store writes. Every write carries
//! preconditions asserting the prior state it was derived from; these preconditions are the only
//! mutual exclusion between the repair machinery and every other cluster actor.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::agency::{plan_collection_attr_path, plan_shard_path};
use crate::models::{ATTR_DISTRIBUTE_SHARDS_LIKE, ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE};
use crate::operations::{AgencyOperation, AgencyPrecondition, AgencyWriteTransaction, GuardPhase, GuardTransaction, MoveShardOperation};

/// The job type name of shard relocation jobs.
pub const JOB_TYPE_MOVE_SHARD: &str = "moveShard";

/// The store subtrees through which supervision jobs flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobBucket {
    ToDo,
    Pending,
    Finished,
    Failed,
}

impl JobBucket {
    /// All buckets, in the order a job moves through them.
    pub const ALL: [JobBucket; 4] = [JobBucket::ToDo, JobBucket::Pending, JobBucket::Finished, JobBucket::Failed];

    /// The store path of this bucket.
    pub fn path(&self) -> &'static str {
        match self {
            Self::ToDo => "Target/ToDo",
            Self::Pending => "Target/Pending",
            Self::Finished => "Target/Finished",
            Self::Failed => "Target/Failed",
        }
    }
}

/// The store path of a job within a bucket.
pub fn job_path(bucket: JobBucket, job_id: &str) -> String {
    format!("{}/{}", bucket.path(), job_id)
}

/// Build the guard which marks the repair of a collection as in progress.
pub fn begin_repair_guard(database: &str, collection: &str, leader: &str) -> GuardTransaction {
    build_guard(GuardPhase::BeginRepair, database, collection, leader)
}

/// Build the guard which marks the repair of a collection as finished.
pub fn finish_repair_guard(database: &str, collection: &str, leader: &str) -> GuardTransaction {
    build_guard(GuardPhase::FinishRepair, database, collection, leader)
}

fn build_guard(phase: GuardPhase, database: &str, collection: &str, leader: &str) -> GuardTransaction {
    let armed = plan_collection_attr_path(database, collection, ATTR_DISTRIBUTE_SHARDS_LIKE);
    let repairing = plan_collection_attr_path(database, collection, ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE);
    let value = Value::String(leader.to_string());
    let (from, to) = match phase {
        GuardPhase::BeginRepair => (armed.clone(), repairing.clone()),
        GuardPhase::FinishRepair => (repairing.clone(), armed.clone()),
    };
    let (armed_pre, repairing_pre) = match phase {
        GuardPhase::BeginRepair => (
            AgencyPrecondition::Value {
                key: armed,
                expected: value.clone(),
            },
            AgencyPrecondition::Empty { key: repairing },
        ),
        GuardPhase::FinishRepair => (
            AgencyPrecondition::Empty { key: armed },
            AgencyPrecondition::Value {
                key: repairing,
                expected: value.clone(),
            },
        ),
    };

    GuardTransaction {
        phase,
        database: database.to_string(),
        collection: collection.to_string(),
        leader: leader.to_string(),
        transaction: AgencyWriteTransaction {
            operations: vec![AgencyOperation::Delete { key: from }, AgencyOperation::Set { key: to, value }],
            preconditions: vec![armed_pre, repairing_pre],
        },
    }
}

/// Build the write which submits a MoveShard job to supervision.
///
/// The job is only accepted if its key is unused and the shard's planned servers still equal
/// `expected_servers`, the list the move was derived from.
pub fn move_shard_job(op: &MoveShardOperation, job_id: &str, expected_servers: &[String], creator: &str, created: DateTime<Utc>) -> AgencyWriteTransaction {
    let key = job_path(JobBucket::ToDo, job_id);
    let job = json!({
        "type": JOB_TYPE_MOVE_SHARD,
        "database": op.database,
        "collection": op.collection,
        "shard": op.shard,
        "fromServer": op.from,
        "toServer": op.to,
        "isLeader": op.is_leader,
        "jobId": job_id,
        "creator": creator,
        "timeCreated": created.to_rfc3339(),
    });
    AgencyWriteTransaction {
        operations: vec![AgencyOperation::Set { key: key.clone(), value: job }],
        preconditions: vec![
            AgencyPrecondition::Empty { key },
            AgencyPrecondition::Value {
                key: plan_shard_path(&op.database, &op.collection, &op.shard),
                expected: json!(expected_servers),
            },
        ],
    }
}

/// Build the write which withdraws a job still waiting in `Target/ToDo`.
///
/// The delete only applies while the queued document is unchanged, so a job supervision already
/// picked up is never touched.
pub fn withdraw_queued_job(job_id: &str, queued: &Value) -> AgencyWriteTransaction {
    let key = job_path(JobBucket::ToDo, job_id);
    AgencyWriteTransaction {
        operations: vec![AgencyOperation::Delete { key: key.clone() }],
        preconditions: vec![AgencyPrecondition::Value {
            key,
            expected: queued.clone(),
        }],
    }
}

/// Encode a transaction in the store's wire format: `[{operations}, {preconditions}]`.
///
/// Keys are rooted under `prefix`.
pub fn encode_write_transaction(txn: &AgencyWriteTransaction, prefix: &str) -> Value {
    let mut operations = Map::new();
    for operation in txn.operations.iter() {
        let encoded = match operation {
            AgencyOperation::Delete { .. } => json!({"op": "delete"}),
            AgencyOperation::Set { value, .. } => json!({"op": "set", "new": value}),
        };
        operations.insert(prefixed_key(prefix, operation.key()), encoded);
    }
    let mut preconditions = Map::new();
    for precondition in txn.preconditions.iter() {
        let encoded = match precondition {
            AgencyPrecondition::Value { expected, .. } => json!({ "old": expected }),
            AgencyPrecondition::Empty { .. } => json!({"oldEmpty": true}),
        };
        preconditions.insert(prefixed_key(prefix, precondition.key()), encoded);
    }
    Value::Array(vec![Value::Object(operations), Value::Object(preconditions)])
}

/// Root a relative key under the given store prefix.
pub fn prefixed_key(prefix: &str, key: &str) -> String {
    let (prefix, key) = (prefix.trim_matches('/'), key.trim_start_matches('/'));
    if prefix.is_empty() {
        format!("/{}", key)
    } else {
        format!("/{}/{}", prefix, key)
    }
}
