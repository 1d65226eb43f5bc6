use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::agency::HttpAgency;
use crate::config::Config;
use crate::repair_loop::RepairLoop;
use crate::server::spawn_prom_server;
use shardrepair_core::agency::AgencyClient;
use shardrepair_core::relocation::{AgencyRelocation, RelocationService};

/// The application object of the repair operator.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handles of the repair loops, by database.
    repair_loops: Vec<(String, JoinHandle<Result<()>>)>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        let agency: Arc<dyn AgencyClient> = Arc::new(HttpAgency::new(&config).context("error initializing coordination store client")?);
        let relocation: Arc<dyn RelocationService> = Arc::new(AgencyRelocation::new(agency.clone()));
        let options = config.repair_options();
        let interval = Duration::from_secs(config.repair_interval_seconds);

        let repair_loops = config
            .database_names()
            .into_iter()
            .map(|database| {
                let handle = RepairLoop::new(
                    database.clone(),
                    interval,
                    agency.clone(),
                    relocation.clone(),
                    options.clone(),
                    shutdown_tx.subscribe(),
                )
                .spawn();
                (database, handle)
            })
            .collect();

        let metrics_server = spawn_prom_server(&config, metrics, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            repair_loops,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("repair operator is shutting down");
        for (database, handle) in self.repair_loops {
            if let Err(err) = handle.await.context("error joining repair loop handle").and_then(|res| res) {
                tracing::error!(error = ?err, database = %database, "error shutting down repair loop");
            }
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        tracing::debug!("repair operator shutdown");
        Ok(())
    }
}
