use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};

use crate::agency::{plan_shard_path, InMemoryAgency};
use crate::checker::check_collection;
use crate::error::{RepairError, RepairResult};
use crate::executor::RepairOptions;
use crate::operations::{MoveShardOperation, RepairPlan};
use crate::planner::plan_repair;
use crate::relocation::{JobId, JobStatus, RelocationService};
use crate::snapshot::parse_snapshot;
use crate::transactions::{job_path, JobBucket};

pub const DATABASE: &str = "someDb";
pub const FOLLOWER: &str = "11111111";
pub const LEADER: &str = "22222222";
pub const SERVER_A: &str = "PRMR-AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA";
pub const SERVER_B: &str = "PRMR-BBBBBBBB-BBBB-BBBB-BBBB-BBBBBBBBBBBB";
pub const SERVER_C: &str = "PRMR-CCCCCCCC-CCCC-CCCC-CCCC-CCCCCCCCCCCC";

/// The plan collections of a database whose follower `11111111` has servers A & B swapped
/// relative to its leader `22222222`.
pub fn plan_collections() -> Value {
    json!({
        DATABASE: {
            FOLLOWER: {
                "name": "_frontend",
                "shards": {"s11": [SERVER_A, SERVER_B]},
                "replicationFactor": 2,
                "distributeShardsLike": LEADER,
            },
            LEADER: {
                "name": "_graphs",
                "replicationFactor": 2,
                "shards": {"s22": [SERVER_B, SERVER_A]},
            },
        }
    })
}

/// Health records with three GOOD servers, along with coordinators which must be ignored.
pub fn health_3_healthy_0_bad() -> Value {
    with_coordinators(json!({
        SERVER_A: {"Status": "GOOD"},
        SERVER_B: {"Status": "GOOD"},
        SERVER_C: {"Status": "GOOD"},
    }))
}

/// Health records where server C is BAD.
pub fn health_2_healthy_1_bad() -> Value {
    with_coordinators(json!({
        SERVER_A: {"Status": "GOOD"},
        SERVER_B: {"Status": "GOOD"},
        SERVER_C: {"Status": "BAD"},
    }))
}

/// Health records where server C is unknown.
pub fn health_2_healthy_0_bad() -> Value {
    with_coordinators(json!({
        SERVER_A: {"Status": "GOOD"},
        SERVER_B: {"Status": "GOOD"},
    }))
}

fn with_coordinators(mut health: Value) -> Value {
    if let Some(records) = health.as_object_mut() {
        for coordinator in [
            "CRDN-976e3d6a-9148-4ece-99e9-326dc69834b2",
            "CRDN-94ea8912-ff22-43d0-a005-bfc87f22709b",
            "CRDN-34b46cab-6f06-40a8-ac24-5eec1cf78f67",
        ]
        .iter()
        {
            records.insert(coordinator.to_string(), json!({}));
        }
    }
    health
}

/// Build a store tree from plan collections & health records.
pub fn store_tree(plan: Value, health: Value) -> Value {
    json!({
        "Plan": {"Collections": plan},
        "Supervision": {"Health": health},
    })
}

/// An in-memory store holding the swapped fixture with the given health records.
pub fn setup_agency(health: Value) -> Arc<InMemoryAgency> {
    Arc::new(InMemoryAgency::new(store_tree(plan_collections(), health)))
}

/// The repair plan of the swapped fixture with three healthy servers.
pub fn fixture_plan() -> Result<RepairPlan> {
    let plan = plan_collections();
    let health = health_3_healthy_0_bad();
    let snapshot = parse_snapshot(DATABASE, Some(&plan[DATABASE]), Some(&health));
    let follower = snapshot.collections.get(FOLLOWER).context("fixture follower missing")?;
    let deviation = check_collection(&snapshot, follower)?;
    plan_repair(&snapshot, &deviation)?.context("expected the fixture to need a repair")
}

/// Process every queued moveShard job the way cluster supervision would: apply the move to the
/// plan and file the job as finished. Returns the number of jobs processed.
pub async fn supervise_jobs(agency: &InMemoryAgency) -> usize {
    let queued = match agency.get(JobBucket::ToDo.path()).await {
        Some(Value::Object(jobs)) => jobs,
        _ => return 0,
    };
    for (id, job) in queued.iter() {
        let field = |name: &str| job.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
        let path = plan_shard_path(&field("database"), &field("collection"), &field("shard"));
        let mut servers: Vec<String> = agency
            .get(&path)
            .await
            .and_then(|raw| serde_json::from_value(raw).ok())
            .unwrap_or_default();
        let from = field("fromServer");
        if let Some(slot) = servers.iter_mut().find(|server| **server == from) {
            *slot = field("toServer");
        }
        agency.set(&path, json!(servers)).await;
        agency.delete(&job_path(JobBucket::ToDo, id)).await;
        agency.set(&job_path(JobBucket::Finished, id), job.clone()).await;
    }
    queued.len()
}

/// Move every queued job to `Target/Pending` without ever finishing it, the way supervision
/// leaves a job whose destination server stalls. Returns the number of jobs started.
pub async fn start_jobs(agency: &InMemoryAgency) -> usize {
    let queued = match agency.get(JobBucket::ToDo.path()).await {
        Some(Value::Object(jobs)) => jobs,
        _ => return 0,
    };
    for (id, job) in queued.iter() {
        agency.delete(&job_path(JobBucket::ToDo, id)).await;
        agency.set(&job_path(JobBucket::Pending, id), job.clone()).await;
    }
    queued.len()
}

/// The number of jobs currently filed under the given bucket.
pub async fn job_count(agency: &InMemoryAgency, bucket: JobBucket) -> usize {
    agency
        .get(bucket.path())
        .await
        .and_then(|jobs| jobs.as_object().map(|jobs| jobs.len()))
        .unwrap_or_default()
}

/// Repair options with short timings, for tests.
pub fn test_options() -> RepairOptions {
    RepairOptions {
        snapshot_max_attempts: 3,
        guard_max_attempts: 3,
        move_max_attempts: 3,
        move_timeout: std::time::Duration::from_millis(200),
        poll_interval: std::time::Duration::from_millis(5),
        backoff_initial: std::time::Duration::from_millis(1),
        backoff_max: std::time::Duration::from_millis(5),
        dry_run: false,
    }
}

/// Read the planned servers of a shard from the in-memory store.
pub async fn shard_servers(agency: &InMemoryAgency, collection: &str, shard: &str) -> Vec<String> {
    agency
        .get(&plan_shard_path(DATABASE, collection, shard))
        .await
        .and_then(|raw| serde_json::from_value(raw).ok())
        .unwrap_or_default()
}

/// A relocation service which applies moves directly to the plan of an in-memory store.
pub struct SimulatedRelocation {
    agency: Arc<InMemoryAgency>,
    state: Mutex<SimulatedState>,
}

#[derive(Default)]
struct SimulatedState {
    /// The number of upcoming moves which will fail.
    failures: u32,
    /// The number of polls each job reports pending before it settles.
    pending_polls: u32,
    /// Signal cancellation once this many moves were submitted.
    cancel_after: Option<(usize, watch::Sender<bool>)>,
    /// Jobs with their remaining pending polls & final status.
    jobs: HashMap<JobId, (u32, JobStatus)>,
    /// Every move submitted, in order.
    submitted: Vec<MoveShardOperation>,
}

impl SimulatedRelocation {
    pub fn new(agency: Arc<InMemoryAgency>) -> Self {
        Self {
            agency,
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Make the next `count` moves fail without touching the plan.
    pub async fn fail_moves(&self, count: u32) {
        self.state.lock().await.failures = count;
    }

    /// Make every job report pending for `count` polls before it settles.
    pub async fn pending_polls(&self, count: u32) {
        self.state.lock().await.pending_polls = count;
    }

    /// Send `true` on the given channel once `count` moves were submitted.
    pub async fn cancel_after(&self, count: usize, tx: watch::Sender<bool>) {
        self.state.lock().await.cancel_after = Some((count, tx));
    }

    /// Every move submitted so far, in order.
    pub async fn submitted(&self) -> Vec<MoveShardOperation> {
        self.state.lock().await.submitted.clone()
    }
}

#[async_trait]
impl RelocationService for SimulatedRelocation {
    async fn move_shard(&self, op: &MoveShardOperation) -> RepairResult<JobId> {
        let mut state = self.state.lock().await;
        state.submitted.push(op.clone());
        let job = format!("job-{}", state.submitted.len());
        let pending = state.pending_polls;

        if state.failures > 0 {
            state.failures -= 1;
            state.jobs.insert(job.clone(), (pending, JobStatus::Failed("simulated failure".into())));
        } else {
            let path = plan_shard_path(&op.database, &op.collection, &op.shard);
            let mut servers: Vec<String> = self
                .agency
                .get(&path)
                .await
                .and_then(|raw| serde_json::from_value(raw).ok())
                .ok_or_else(|| RepairError::conflict(&op.collection, "simulated shard not found"))?;
            if let Some(slot) = servers.iter_mut().find(|server| **server == op.from) {
                *slot = op.to.clone();
            }
            self.agency.set(&path, json!(servers)).await;
            state.jobs.insert(job.clone(), (pending, JobStatus::InSync));
        }

        let submitted = state.submitted.len();
        if let Some((count, tx)) = &state.cancel_after {
            if submitted >= *count {
                let _ = tx.send(true);
            }
        }
        Ok(job)
    }

    async fn status(&self, job: &JobId) -> RepairResult<JobStatus> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(job) {
            Some((remaining, _)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(JobStatus::Pending)
            }
            Some((_, status)) => Ok(status.clone()),
            None => Ok(JobStatus::Failed(format!("unknown job {}", job))),
        }
    }

    /// Simulated jobs take effect on submission, so there is never anything left to withdraw.
    async fn abort(&self, _job: &JobId) -> RepairResult<bool> {
        Ok(false)
    }
}
