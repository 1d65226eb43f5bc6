//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use shardrepair_core::RepairOptions;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for serving metrics.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// The base URL of the coordination store, e.g. `http://agency:8531`.
    pub agency_endpoint: String,
    /// The root key under which the cluster keeps its coordination data.
    #[serde(default = "default_agency_prefix")]
    pub agency_prefix: String,
    /// An optional bearer token presented to the coordination store.
    #[serde(default)]
    pub agency_jwt: Option<String>,
    /// The duration in seconds after which a request to the coordination store is abandoned.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// The databases to keep repaired, comma separated.
    pub databases: Vec<String>,
    /// The duration in seconds between the start of two repair cycles of a database.
    #[serde(default = "default_repair_interval_seconds")]
    pub repair_interval_seconds: u64,

    /// Attempts to read a topology snapshot before a cycle gives up.
    #[serde(default = "default_snapshot_max_attempts")]
    pub snapshot_max_attempts: u32,
    /// Attempts to submit a guard transaction while the store is unreachable.
    #[serde(default = "default_guard_max_attempts")]
    pub guard_max_attempts: u32,
    /// Attempts of a single MoveShard step.
    #[serde(default = "default_move_max_attempts")]
    pub move_max_attempts: u32,
    /// The duration in seconds a MoveShard attempt may take to reach in-sync.
    #[serde(default = "default_move_timeout_seconds")]
    pub move_timeout_seconds: u64,
    /// The interval in milliseconds at which MoveShard jobs are polled.
    #[serde(default = "default_move_poll_millis")]
    pub move_poll_millis: u64,
    /// The first retry delay in milliseconds.
    #[serde(default = "default_backoff_initial_millis")]
    pub backoff_initial_millis: u64,
    /// The largest retry delay in milliseconds.
    #[serde(default = "default_backoff_max_millis")]
    pub backoff_max_millis: u64,

    /// Plan & report repairs without writing anything.
    #[serde(default)]
    pub dry_run: bool,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for values which parse but can not work.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.databases.iter().all(|db| db.trim().is_empty()), "DATABASES must name at least one database");
        ensure!(self.repair_interval_seconds > 0, "REPAIR_INTERVAL_SECONDS must be greater than 0");
        ensure!(
            self.snapshot_max_attempts > 0 && self.guard_max_attempts > 0 && self.move_max_attempts > 0,
            "attempt limits must be greater than 0"
        );
        ensure!(self.backoff_initial_millis <= self.backoff_max_millis, "BACKOFF_INITIAL_MILLIS must not exceed BACKOFF_MAX_MILLIS");
        Ok(())
    }

    /// The configured databases, trimmed, without empty entries.
    pub fn database_names(&self) -> Vec<String> {
        self.databases
            .iter()
            .map(|db| db.trim())
            .filter(|db| !db.is_empty())
            .map(String::from)
            .collect()
    }

    /// The repair machinery's options according to this config.
    pub fn repair_options(&self) -> RepairOptions {
        RepairOptions {
            snapshot_max_attempts: self.snapshot_max_attempts,
            guard_max_attempts: self.guard_max_attempts,
            move_max_attempts: self.move_max_attempts,
            move_timeout: Duration::from_secs(self.move_timeout_seconds),
            poll_interval: Duration::from_millis(self.move_poll_millis),
            backoff_initial: Duration::from_millis(self.backoff_initial_millis),
            backoff_max: Duration::from_millis(self.backoff_max_millis),
            dry_run: self.dry_run,
        }
    }
}

fn default_metrics_port() -> u16 {
    7002
}

fn default_agency_prefix() -> String {
    "arango".into()
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_repair_interval_seconds() -> u64 {
    60
}

fn default_snapshot_max_attempts() -> u32 {
    5
}

fn default_guard_max_attempts() -> u32 {
    3
}

fn default_move_max_attempts() -> u32 {
    3
}

fn default_move_timeout_seconds() -> u64 {
    600
}

fn default_move_poll_millis() -> u64 {
    1000
}

fn default_backoff_initial_millis() -> u64 {
    500
}

fn default_backoff_max_millis() -> u64 {
    30_000
}
