//! Repair metrics.
//!
//! Metrics are recorded through the `metrics` facade; they are no-ops until the hosting process
//! installs a recorder.

pub const METRIC_CYCLES: &str = "shardrepair_cycles_total";
pub const METRIC_SNAPSHOT_FAILURES: &str = "shardrepair_snapshot_failures_total";
pub const METRIC_GUARDS_APPLIED: &str = "shardrepair_guard_transactions_total";
pub const METRIC_GUARDS_RECONCILED: &str = "shardrepair_guard_transactions_reconciled_total";
pub const METRIC_MOVES_APPLIED: &str = "shardrepair_move_shard_total";
pub const METRIC_MOVES_SKIPPED: &str = "shardrepair_move_shard_skipped_total";
pub const METRIC_MOVE_RETRIES: &str = "shardrepair_move_shard_retries_total";
pub const METRIC_COLLECTIONS_REPAIRED: &str = "shardrepair_collections_repaired_total";
pub const METRIC_COLLECTIONS_FAILED: &str = "shardrepair_collections_failed_total";

/// Register the repair metrics.
///
/// This function should be called only once, early in the lifetime of the process.
pub fn register_repair_metrics() {
    metrics::register_counter!(METRIC_CYCLES, metrics::Unit::Count, "Number of repair cycles run.");
    metrics::register_counter!(METRIC_SNAPSHOT_FAILURES, metrics::Unit::Count, "Number of failed topology snapshot reads.");
    metrics::register_counter!(METRIC_GUARDS_APPLIED, metrics::Unit::Count, "Number of guard transactions applied.");
    metrics::register_counter!(
        METRIC_GUARDS_RECONCILED,
        metrics::Unit::Count,
        "Number of rejected guard transactions found to be already applied."
    );
    metrics::register_counter!(METRIC_MOVES_APPLIED, metrics::Unit::Count, "Number of MoveShard steps completed.");
    metrics::register_counter!(METRIC_MOVES_SKIPPED, metrics::Unit::Count, "Number of MoveShard steps found to be already applied.");
    metrics::register_counter!(METRIC_MOVE_RETRIES, metrics::Unit::Count, "Number of retried MoveShard attempts.");
    metrics::register_counter!(METRIC_COLLECTIONS_REPAIRED, metrics::Unit::Count, "Number of collections fully repaired.");
    metrics::register_counter!(METRIC_COLLECTIONS_FAILED, metrics::Unit::Count, "Number of collections whose repair failed.");
}
