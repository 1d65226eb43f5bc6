//! Shard relocation service abstractions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::agency::{plan_shard_path, AgencyClient};
use crate::error::{RepairError, RepairResult};
use crate::operations::{MoveShardOperation, WriteOutcome};
use crate::transactions::{job_path, move_shard_job, withdraw_queued_job, JobBucket};

/// The default creator name recorded on submitted jobs.
pub const DEFAULT_JOB_CREATOR: &str = "shardrepair";

/// A token identifying a submitted relocation.
pub type JobId = String;

/// The progress of a submitted relocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// The relocation has not yet completed.
    Pending,
    /// The replica is fully in sync on the destination server.
    InSync,
    /// The relocation failed, with the reason given by the service.
    Failed(String),
}

/// A service able to relocate single shard replicas.
#[async_trait]
pub trait RelocationService: Send + Sync {
    /// Submit a relocation, returning a token used to query its progress.
    async fn move_shard(&self, op: &MoveShardOperation) -> RepairResult<JobId>;

    /// Query the progress of a submitted relocation.
    async fn status(&self, job: &JobId) -> RepairResult<JobStatus>;

    /// Withdraw a submitted relocation which has not started yet.
    ///
    /// Returns `true` if the relocation will never run, `false` if it already started or settled.
    async fn abort(&self, job: &JobId) -> RepairResult<bool>;
}

/// A relocation service which submits MoveShard jobs to the cluster supervision through the
/// coordination store, and tracks them through the store's job buckets.
pub struct AgencyRelocation {
    agency: Arc<dyn AgencyClient>,
    creator: String,
}

impl AgencyRelocation {
    /// Create a new instance.
    pub fn new(agency: Arc<dyn AgencyClient>) -> Self {
        Self {
            agency,
            creator: DEFAULT_JOB_CREATOR.to_string(),
        }
    }

    /// Set the creator name recorded on submitted jobs.
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }
}

#[async_trait]
impl RelocationService for AgencyRelocation {
    #[tracing::instrument(level = "debug", skip(self, op), fields(shard = %op.shard, from = %op.from, to = %op.to))]
    async fn move_shard(&self, op: &MoveShardOperation) -> RepairResult<JobId> {
        let servers = read_shard_servers(self.agency.as_ref(), op).await?;
        let job_id = Uuid::new_v4().to_simple().to_string();
        let txn = move_shard_job(op, &job_id, &servers, &self.creator, chrono::Utc::now());
        match self.agency.write(&txn).await? {
            WriteOutcome::Applied => {
                tracing::debug!(job = %job_id, "moveShard job submitted");
                Ok(job_id)
            }
            WriteOutcome::PreconditionFailed => Err(RepairError::conflict(
                &op.collection,
                format!("placement of shard {} changed while submitting its moveShard job", op.shard),
            )),
        }
    }

    async fn status(&self, job: &JobId) -> RepairResult<JobStatus> {
        for bucket in JobBucket::ALL.iter() {
            let found = match self.agency.read(&job_path(*bucket, job)).await? {
                Some(found) => found,
                None => continue,
            };
            return Ok(match bucket {
                JobBucket::ToDo | JobBucket::Pending => JobStatus::Pending,
                JobBucket::Finished => JobStatus::InSync,
                JobBucket::Failed => JobStatus::Failed(
                    found
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("job failed without a reason")
                        .to_string(),
                ),
            });
        }
        Ok(JobStatus::Failed(format!("job {} not found in any job bucket", job)))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn abort(&self, job: &JobId) -> RepairResult<bool> {
        let queued = match self.agency.read(&job_path(JobBucket::ToDo, job)).await? {
            Some(queued) => queued,
            None => return Ok(false),
        };
        match self.agency.write(&withdraw_queued_job(job, &queued)).await? {
            WriteOutcome::Applied => {
                tracing::debug!(%job, "queued moveShard job withdrawn");
                Ok(true)
            }
            WriteOutcome::PreconditionFailed => Ok(false),
        }
    }
}

/// Read the planned server list of the shard an operation targets.
pub async fn read_shard_servers(agency: &dyn AgencyClient, op: &MoveShardOperation) -> RepairResult<Vec<String>> {
    let raw = agency
        .read(&plan_shard_path(&op.database, &op.collection, &op.shard))
        .await?
        .ok_or_else(|| RepairError::conflict(&op.collection, format!("shard {} no longer exists in plan", op.shard)))?;
    serde_json::from_value(raw).map_err(|err| RepairError::conflict(&op.collection, format!("malformed server list of shard {}: {}", op.shard, err)))
}
