//! Repair cycle driver.
//!
//! One cycle reads a fresh snapshot of a database, checks every follower collection, plans the
//! repair of each deviating collection and executes the plans one collection at a time. Leaders
//! are visited before their followers, and a follower whose leader was repaired earlier in the
//! same cycle is checked again against a fresh snapshot. Failures are isolated per collection
//! and captured in the cycle report; only an unreadable snapshot or cancellation while waiting
//! for one fails the cycle as a whole.


use std::collections::BTreeSet;

use backoff::backoff::Backoff;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::agency::AgencyClient;
use crate::checker::{check_collection, check_snapshot, CollectionCheck, Deviation};
use crate::error::{RepairError, RepairResult};
use crate::executor::{sleep_unless_cancelled, ExecutionSummary, Executor, RepairOptions};
use crate::models::Snapshot;
use crate::operations::RepairPlan;
use crate::planner::plan_repair;
use crate::prom::{METRIC_COLLECTIONS_FAILED, METRIC_COLLECTIONS_REPAIRED, METRIC_CYCLES, METRIC_SNAPSHOT_FAILURES};
use crate::relocation::RelocationService;
use crate::snapshot::read_snapshot;

/// What happened to one follower collection during a cycle.
#[derive(Debug)]
pub enum CollectionOutcome {
    /// The collection mirrors its leader, nothing to do.
    Consistent,
    /// A plan was built but not executed (dry run).
    Planned(RepairPlan),
    /// The plan was executed to completion.
    Repaired { plan: RepairPlan, summary: ExecutionSummary },
}

/// The report entry of one follower collection.
#[derive(Debug)]
pub struct CollectionReport {
    pub collection: String,
    pub collection_name: String,
    pub outcome: RepairResult<CollectionOutcome>,
}

impl CollectionReport {
    /// A JSON rendition of this entry, for logging.
    pub fn to_json(&self) -> Value {
        let outcome = match &self.outcome {
            Ok(CollectionOutcome::Consistent) => json!({"status": "consistent"}),
            Ok(CollectionOutcome::Planned(plan)) => json!({"status": "planned", "plan": plan}),
            Ok(CollectionOutcome::Repaired { plan, summary }) => json!({
                "status": "repaired",
                "operations": plan.operations.len(),
                "movesApplied": summary.moves_applied,
                "movesSkipped": summary.moves_skipped,
                "guardsApplied": summary.guards_applied,
                "guardsReconciled": summary.guards_reconciled,
            }),
            Err(err) => json!({"status": "failed", "error": err.kind(), "message": err.to_string()}),
        };
        json!({"collection": self.collection, "name": self.collection_name, "outcome": outcome})
    }
}

/// The report of one repair cycle over one database.
#[derive(Debug)]
pub struct CycleReport {
    pub database: String,
    pub collections: Vec<CollectionReport>,
    /// True if the cycle was abandoned before visiting every collection.
    pub cancelled: bool,
}

impl CycleReport {
    /// The entries of collections whose check, plan or execution failed.
    pub fn failures(&self) -> impl Iterator<Item = &CollectionReport> {
        self.collections.iter().filter(|report| report.outcome.is_err())
    }

    /// The number of collections repaired during this cycle.
    pub fn repaired(&self) -> usize {
        self.collections
            .iter()
            .filter(|report| matches!(report.outcome, Ok(CollectionOutcome::Repaired { .. })))
            .count()
    }

    /// Look up the entry of a collection by id.
    pub fn get(&self, collection: &str) -> Option<&CollectionReport> {
        self.collections.iter().find(|report| report.collection == collection)
    }

    /// A JSON rendition of this report, for logging.
    pub fn to_json(&self) -> Value {
        json!({
            "database": self.database,
            "cancelled": self.cancelled,
            "collections": self.collections.iter().map(CollectionReport::to_json).collect::<Vec<_>>(),
        })
    }
}

/// A repair cycle over the collections of databases, bound to its collaborators.
pub struct RepairCycle<'a> {
    agency: &'a dyn AgencyClient,
    relocation: &'a dyn RelocationService,
    options: &'a RepairOptions,
    cancel: watch::Receiver<bool>,
}

impl<'a> RepairCycle<'a> {
    /// Create a new instance.
    pub fn new(agency: &'a dyn AgencyClient, relocation: &'a dyn RelocationService, options: &'a RepairOptions, cancel: watch::Receiver<bool>) -> Self {
        Self {
            agency,
            relocation,
            options,
            cancel,
        }
    }

    /// Run one cycle over the given database.
    ///
    /// Fails with `SnapshotUnavailable` once all snapshot read attempts are exhausted, or with
    /// `Cancelled` when cancelled while waiting to retry a snapshot read.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn run(&self, database: &str) -> RepairResult<CycleReport> {
        metrics::increment_counter!(METRIC_CYCLES, "database" => database.to_string());
        let mut snapshot = self.read_snapshot_with_retries(database).await?;
        let mut report = CycleReport {
            database: database.to_string(),
            collections: vec![],
            cancelled: false,
        };

        // Collections whose placement this cycle set out to change.
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let checks = check_snapshot(&snapshot);
        for check in checks {
            if *self.cancel.borrow() {
                report.cancelled = true;
                break;
            }
            let CollectionCheck {
                collection,
                collection_name,
                leader,
                result,
            } = check;
            let leader_touched = leader.as_ref().map(|leader| touched.contains(leader)).unwrap_or(false);
            let result = if leader_touched {
                tracing::debug!(collection = %collection, "leader changed during this cycle, checking against its current placement");
                match self.recheck(database, &collection).await {
                    Ok((fresh, result)) => {
                        snapshot = fresh;
                        result
                    }
                    Err(err) => Err(err),
                }
            } else {
                result
            };
            if !self.options.dry_run && matches!(&result, Ok(deviation) if deviation.needs_repair()) {
                touched.insert(collection.clone());
            }

            let outcome = match result {
                Ok(deviation) => self.repair_collection(&snapshot, &deviation).await,
                Err(err) => Err(err),
            };
            match &outcome {
                Ok(CollectionOutcome::Repaired { .. }) => {
                    metrics::increment_counter!(METRIC_COLLECTIONS_REPAIRED, "database" => database.to_string());
                }
                Ok(_) => (),
                Err(RepairError::Cancelled) => report.cancelled = true,
                Err(err) => {
                    metrics::increment_counter!(METRIC_COLLECTIONS_FAILED, "database" => database.to_string(), "error" => err.kind());
                    tracing::error!(error = %err, collection = %collection, "collection repair failed");
                }
            }
            report.collections.push(CollectionReport {
                collection,
                collection_name,
                outcome,
            });
        }

        tracing::info!(
            database,
            followers = report.collections.len(),
            repaired = report.repaired(),
            failed = report.failures().count(),
            cancelled = report.cancelled,
            "repair cycle finished"
        );
        Ok(report)
    }

    /// Plan, and unless running dry, execute the repair of one checked collection.
    async fn repair_collection(&self, snapshot: &Snapshot, deviation: &Deviation) -> RepairResult<CollectionOutcome> {
        let plan = match plan_repair(snapshot, deviation)? {
            Some(plan) => plan,
            None => return Ok(CollectionOutcome::Consistent),
        };
        tracing::info!(
            collection = %plan.collection,
            name = %plan.collection_name,
            operations = plan.operations.len(),
            moves = plan.move_count(),
            dry_run = self.options.dry_run,
            "repair plan built"
        );
        if self.options.dry_run {
            return Ok(CollectionOutcome::Planned(plan));
        }
        let summary = Executor::new(self.agency, self.relocation, self.options, self.cancel.clone())
            .execute(&plan)
            .await?;
        Ok(CollectionOutcome::Repaired { plan, summary })
    }

    /// Read a fresh snapshot and check one follower against its leader's current placement.
    async fn recheck(&self, database: &str, collection: &str) -> RepairResult<(Snapshot, RepairResult<Deviation>)> {
        let snapshot = self.read_snapshot_with_retries(database).await?;
        let result = match snapshot.collections.get(collection) {
            Some(follower) => check_collection(&snapshot, follower),
            None => Err(RepairError::conflict(collection, "collection disappeared during the repair cycle")),
        };
        Ok((snapshot, result))
    }

    async fn read_snapshot_with_retries(&self, database: &str) -> RepairResult<Snapshot> {
        let mut backoff = self.options.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match read_snapshot(self.agency, database).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) => {
                    metrics::increment_counter!(METRIC_SNAPSHOT_FAILURES, "database" => database.to_string());
                    if attempt >= self.options.snapshot_max_attempts {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, attempt, "error reading topology snapshot, will retry");
                    sleep_unless_cancelled(&self.cancel, backoff.next_backoff().unwrap_or(self.options.backoff_max)).await?;
                }
            }
        }
    }
}
