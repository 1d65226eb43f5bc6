//! Executor & retry controller.
//!
//! Executes the operations of a repair plan strictly in order:
//!
//! - Guard transactions are written as-is. When the store rejects one, the collection's plan
//!   entry is re-read: if the rename is already in place (e.g. a previous attempt applied but its
//!   reply was lost) the guard counts as applied, otherwise the repair of the collection aborts
//!   with a conflict.
//! - MoveShard steps first verify the shard's current placement. A step whose effect is already
//!   present is skipped, a step whose source replica is gone aborts with a conflict. Otherwise the
//!   step is delegated to the relocation service and polled until the replica is in sync on the
//!   destination, which acts as a barrier before the next step. Failures and timeouts are retried
//!   with exponential backoff up to a bounded number of attempts. A step never has more than one
//!   live job: a timed out job is withdrawn while still queued, or waited on again otherwise.
//!
//! A cancellation signal is checked at every step boundary. Abandoning a plan there is safe, as
//! every effect is durably recorded in the store and re-verified before the next step.


use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::agency::{plan_collection_path, AgencyClient};
use crate::error::{RepairError, RepairResult};
use crate::models::{ATTR_DISTRIBUTE_SHARDS_LIKE, ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE};
use crate::operations::{GuardPhase, GuardTransaction, MoveShardOperation, RepairOperation, RepairPlan, WriteOutcome};
use crate::prom::{METRIC_GUARDS_APPLIED, METRIC_GUARDS_RECONCILED, METRIC_MOVES_APPLIED, METRIC_MOVES_SKIPPED, METRIC_MOVE_RETRIES};
use crate::relocation::{read_shard_servers, JobId, JobStatus, RelocationService};

/// Tuning of the repair machinery's retries, timeouts & modes.
#[derive(Clone, Debug)]
pub struct RepairOptions {
    /// Attempts to read a topology snapshot before a cycle gives up.
    pub snapshot_max_attempts: u32,
    /// Attempts to submit a guard transaction when the store can not be reached.
    pub guard_max_attempts: u32,
    /// Attempts of a single MoveShard step.
    pub move_max_attempts: u32,
    /// How long a single MoveShard attempt may take to reach in-sync.
    pub move_timeout: Duration,
    /// How often the relocation service is polled.
    pub poll_interval: Duration,
    /// The first retry delay.
    pub backoff_initial: Duration,
    /// The largest retry delay.
    pub backoff_max: Duration,
    /// Plan and report without writing anything.
    pub dry_run: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            snapshot_max_attempts: 5,
            guard_max_attempts: 3,
            move_max_attempts: 3,
            move_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

impl RepairOptions {
    /// A fresh exponential backoff according to these options. It never gives up on its own,
    /// attempt counts bound all retries.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.backoff_initial,
            initial_interval: self.backoff_initial,
            max_interval: self.backoff_max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Counters of what an executed plan actually did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Guard transactions applied by this executor.
    pub guards_applied: usize,
    /// Rejected guard transactions found to be already in place.
    pub guards_reconciled: usize,
    /// MoveShard steps completed by this executor.
    pub moves_applied: usize,
    /// MoveShard steps found to be already in place.
    pub moves_skipped: usize,
}

/// The observed placement of a shard relative to one move.
enum MoveState {
    /// `from` holds a replica and `to` does not.
    Ready,
    /// `to` holds a replica and `from` does not.
    Done,
    /// Anything else.
    Unexpected(Vec<String>),
}

/// Executes repair plans against a coordination store & relocation service.
pub struct Executor<'a> {
    agency: &'a dyn AgencyClient,
    relocation: &'a dyn RelocationService,
    options: &'a RepairOptions,
    cancel: watch::Receiver<bool>,
}

impl<'a> Executor<'a> {
    /// Create a new instance.
    ///
    /// The plan is abandoned at the next step boundary once `cancel` holds `true`.
    pub fn new(agency: &'a dyn AgencyClient, relocation: &'a dyn RelocationService, options: &'a RepairOptions, cancel: watch::Receiver<bool>) -> Self {
        Self {
            agency,
            relocation,
            options,
            cancel,
        }
    }

    /// Execute all operations of the plan, in order.
    #[tracing::instrument(level = "debug", skip(self, plan), fields(database = %plan.database, collection = %plan.collection))]
    pub async fn execute(&self, plan: &RepairPlan) -> RepairResult<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();
        for (step, operation) in plan.operations.iter().enumerate() {
            self.check_cancelled()?;
            tracing::debug!(step, total = plan.operations.len(), "executing repair step");
            match operation {
                RepairOperation::GuardTransaction(guard) => {
                    if self.execute_guard(guard).await? {
                        summary.guards_applied += 1;
                    } else {
                        summary.guards_reconciled += 1;
                    }
                }
                RepairOperation::MoveShard(op) => {
                    if self.execute_move(op).await? {
                        summary.moves_applied += 1;
                    } else {
                        summary.moves_skipped += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Execute a guard transaction, returning `false` if it was found to be already applied.
    #[tracing::instrument(level = "debug", skip(self, guard), fields(phase = ?guard.phase))]
    async fn execute_guard(&self, guard: &GuardTransaction) -> RepairResult<bool> {
        let mut backoff = self.options.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.agency.write(&guard.transaction).await {
                Ok(WriteOutcome::Applied) => {
                    metrics::increment_counter!(METRIC_GUARDS_APPLIED);
                    tracing::info!(collection = %guard.collection, phase = ?guard.phase, "guard transaction applied");
                    return Ok(true);
                }
                Ok(WriteOutcome::PreconditionFailed) => {
                    self.reconcile_guard(guard).await?;
                    metrics::increment_counter!(METRIC_GUARDS_RECONCILED);
                    tracing::info!(collection = %guard.collection, phase = ?guard.phase, "guard transaction already in place");
                    return Ok(false);
                }
                Err(err) if attempt < self.options.guard_max_attempts => {
                    tracing::warn!(error = ?err, attempt, "error submitting guard transaction, will retry");
                    self.sleep(backoff.next_backoff().unwrap_or(self.options.backoff_max)).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Re-read the collection's plan entry and check if the guard's rename is already in place.
    async fn reconcile_guard(&self, guard: &GuardTransaction) -> RepairResult<()> {
        let entry = self
            .agency
            .read(&plan_collection_path(&guard.database, &guard.collection))
            .await?
            .ok_or_else(|| RepairError::conflict(&guard.collection, "collection was dropped during repair"))?;
        let leader = Value::String(guard.leader.clone());
        let (armed, repairing) = (entry.get(ATTR_DISTRIBUTE_SHARDS_LIKE), entry.get(ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE));
        let in_place = match guard.phase {
            GuardPhase::BeginRepair => armed.is_none() && repairing == Some(&leader),
            GuardPhase::FinishRepair => armed == Some(&leader) && repairing.is_none(),
        };
        if in_place {
            return Ok(());
        }
        Err(RepairError::conflict(
            &guard.collection,
            format!(
                "guard {:?} rejected, found {}={:?} and {}={:?}",
                guard.phase, ATTR_DISTRIBUTE_SHARDS_LIKE, armed, ATTR_REPAIR_DISTRIBUTE_SHARDS_LIKE, repairing
            ),
        ))
    }

    /// Execute a MoveShard step, returning `false` if it was found to be already applied.
    ///
    /// At most one job of the step is live at any time. A job which timed out is withdrawn before
    /// the step is resubmitted; a job which can not be withdrawn any more is waited on again by
    /// the next attempt.
    #[tracing::instrument(level = "debug", skip(self, op), fields(shard = %op.shard, from = %op.from, to = %op.to, is_leader = op.is_leader))]
    async fn execute_move(&self, op: &MoveShardOperation) -> RepairResult<bool> {
        let mut backoff = self.options.backoff();
        let mut job: Option<JobId> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reason = match self.attempt_move(op, &mut job).await {
                Ok(Ok(applied)) => return Ok(applied),
                Ok(Err(reason)) => reason,
                Err(err) => {
                    if let Some(live) = job.take() {
                        self.withdraw_job(live).await;
                    }
                    return Err(err);
                }
            };
            if let Some(live) = job.take() {
                job = self.withdraw_job(live).await;
            }
            if attempt >= self.options.move_max_attempts {
                tracing::error!(attempt, %reason, "MoveShard step failed, giving up");
                let reason = match &job {
                    Some(live) => format!("{}; job {} could not be withdrawn and may still run", reason, live),
                    None => reason,
                };
                return Err(RepairError::RelocationFailed {
                    shard: op.shard.clone(),
                    from: op.from.clone(),
                    to: op.to.clone(),
                    attempts: attempt,
                    reason,
                });
            }
            metrics::increment_counter!(METRIC_MOVE_RETRIES);
            tracing::warn!(attempt, %reason, "MoveShard step failed, will retry");
            self.sleep(backoff.next_backoff().unwrap_or(self.options.backoff_max)).await?;
        }
    }

    /// Run one attempt of a MoveShard step.
    ///
    /// `job` holds the step's live job, if any. It is waited on instead of submitting a new one,
    /// and cleared once the job settled. The outer error aborts the collection's repair, the inner
    /// error is a retryable failure.
    async fn attempt_move(&self, op: &MoveShardOperation, job: &mut Option<JobId>) -> RepairResult<Result<bool, String>> {
        match self.observe_move(op).await {
            Ok(MoveState::Done) => {
                if job.take().is_some() {
                    metrics::increment_counter!(METRIC_MOVES_APPLIED);
                    tracing::info!("MoveShard step completed by its previously submitted job");
                    return Ok(Ok(true));
                }
                metrics::increment_counter!(METRIC_MOVES_SKIPPED);
                tracing::info!("MoveShard step already in place, skipping");
                return Ok(Ok(false));
            }
            Ok(MoveState::Ready) => (),
            Ok(MoveState::Unexpected(servers)) => {
                return Err(RepairError::conflict(
                    &op.collection,
                    format!("shard {} placement {:?} does not allow moving {} to {}", op.shard, servers, op.from, op.to),
                ))
            }
            Err(RepairError::Agency(err)) => return Ok(Err(format!("error reading shard placement: {}", err))),
            Err(err) => return Err(err),
        }

        let live = match job.clone() {
            Some(live) => {
                tracing::debug!(job = %live, "waiting on previously submitted MoveShard job");
                live
            }
            None => {
                let submitted = match self.relocation.move_shard(op).await {
                    Ok(submitted) => submitted,
                    Err(RepairError::Agency(err)) => return Ok(Err(format!("error submitting move: {}", err))),
                    Err(err) => return Err(err),
                };
                tracing::debug!(job = %submitted, "MoveShard submitted, waiting for replica to be in sync");
                *job = Some(submitted.clone());
                submitted
            }
        };

        let deadline = Instant::now() + self.options.move_timeout;
        loop {
            match self.relocation.status(&live).await {
                Ok(JobStatus::InSync) => {
                    *job = None;
                    break;
                }
                Ok(JobStatus::Failed(reason)) => {
                    *job = None;
                    return Ok(Err(reason));
                }
                Ok(JobStatus::Pending) => (),
                Err(RepairError::Agency(err)) => tracing::warn!(error = ?err, job = %live, "error polling MoveShard status"),
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Ok(Err(format!("timed out after {:?} waiting for job {}", self.options.move_timeout, live)));
            }
            self.sleep(self.options.poll_interval).await?;
        }

        match self.observe_move(op).await {
            Ok(MoveState::Done) => {
                metrics::increment_counter!(METRIC_MOVES_APPLIED);
                tracing::info!(job = %live, "MoveShard step completed");
                Ok(Ok(true))
            }
            Ok(_) => Ok(Err(format!("job {} finished but the plan does not reflect the move", live))),
            Err(RepairError::Agency(err)) => Ok(Err(format!("error verifying shard placement: {}", err))),
            Err(err) => Err(err),
        }
    }

    /// Withdraw a job which has not started yet, handing it back if it has to be waited on.
    async fn withdraw_job(&self, job: JobId) -> Option<JobId> {
        match self.relocation.abort(&job).await {
            Ok(true) => {
                tracing::info!(%job, "queued MoveShard job withdrawn");
                None
            }
            Ok(false) => {
                tracing::debug!(%job, "MoveShard job already started, keeping it");
                Some(job)
            }
            Err(err) => {
                tracing::warn!(error = ?err, %job, "error withdrawing MoveShard job");
                Some(job)
            }
        }
    }

    /// Observe the current placement of the shard a move targets.
    async fn observe_move(&self, op: &MoveShardOperation) -> RepairResult<MoveState> {
        let servers = read_shard_servers(self.agency, op).await?;
        let (has_from, has_to) = (servers.contains(&op.from), servers.contains(&op.to));
        Ok(match (has_from, has_to) {
            (true, false) => MoveState::Ready,
            (false, true) => MoveState::Done,
            _ => MoveState::Unexpected(servers),
        })
    }

    /// Sleep for the given duration, returning early with an error if cancelled.
    async fn sleep(&self, duration: Duration) -> RepairResult<()> {
        sleep_unless_cancelled(&self.cancel, duration).await
    }

    fn check_cancelled(&self) -> RepairResult<()> {
        if *self.cancel.borrow() {
            return Err(RepairError::Cancelled);
        }
        Ok(())
    }
}

/// Sleep for the given duration, returning `Cancelled` as soon as `cancel` holds `true`.
pub(crate) async fn sleep_unless_cancelled(cancel: &watch::Receiver<bool>, duration: Duration) -> RepairResult<()> {
    if *cancel.borrow() {
        return Err(RepairError::Cancelled);
    }
    let mut cancel = cancel.clone();
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        Ok(_) = cancel.changed() => {
            if *cancel.borrow() {
                return Err(RepairError::Cancelled);
            }
            Ok(())
        }
    }
}
