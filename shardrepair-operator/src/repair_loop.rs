//! Periodic repair of one database.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use shardrepair_core::agency::AgencyClient;
use shardrepair_core::relocation::RelocationService;
use shardrepair_core::{CycleReport, RepairCycle, RepairError, RepairOptions};

/// A task running repair cycles over one database at a fixed interval.
///
/// On shutdown, a running cycle is cancelled and abandoned at its next step boundary. Progress
/// made so far is durably recorded in the store, so the next start resumes it.
pub struct RepairLoop {
    database: String,
    interval: Duration,
    agency: Arc<dyn AgencyClient>,
    relocation: Arc<dyn RelocationService>,
    options: RepairOptions,
    shutdown: broadcast::Receiver<()>,
}

impl RepairLoop {
    /// Create a new instance.
    pub fn new(
        database: String, interval: Duration, agency: Arc<dyn AgencyClient>, relocation: Arc<dyn RelocationService>, options: RepairOptions,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            database,
            interval,
            agency,
            relocation,
            options,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(database = %self.database))]
    async fn run(mut self) -> Result<()> {
        tracing::info!(interval = ?self.interval, dry_run = self.options.dry_run, "repair loop started");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => (),
                _ = self.shutdown.recv() => break,
            }

            let cycle = RepairCycle::new(self.agency.as_ref(), self.relocation.as_ref(), &self.options, cancel_rx.clone());
            let run = cycle.run(&self.database);
            tokio::pin!(run);
            let mut shutting_down = false;
            let res = tokio::select! {
                res = &mut run => res,
                _ = self.shutdown.recv() => {
                    tracing::info!("shutdown requested, cancelling running repair cycle");
                    shutting_down = true;
                    let _ = cancel_tx.send(true);
                    run.await
                }
            };
            match res {
                Ok(report) => log_report(&report),
                Err(RepairError::Cancelled) => tracing::info!("repair cycle cancelled"),
                Err(err) => tracing::error!(error = %err, "repair cycle failed"),
            }
            if shutting_down {
                break;
            }
        }

        tracing::debug!("repair loop shut down");
        Ok(())
    }
}

fn log_report(report: &CycleReport) {
    for entry in report.failures() {
        if let Err(err) = &entry.outcome {
            tracing::warn!(
                collection = %entry.collection,
                name = %entry.collection_name,
                error = err.kind(),
                "{}", err
            );
        }
    }
    tracing::info!(report = %report.to_json(), "repair cycle report");
}
