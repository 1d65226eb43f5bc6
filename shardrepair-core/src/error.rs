//! Repair error abstractions.

use thiserror::Error;

/// Errors returned from a coordination store client.
#[derive(Debug, Error)]
pub enum AgencyError {
    /// The store could not be reached, or did not answer in time.
    #[error("coordination store unreachable: {0}")]
    Unreachable(String),
    /// The store answered with something that could not be understood.
    #[error("coordination store protocol error: {0}")]
    Protocol(String),
}

/// Repair error variants.
///
/// Every variant other than `SnapshotUnavailable` is scoped to a single collection, and is
/// recorded in that collection's entry of the cycle report.
#[derive(Debug, Error)]
pub enum RepairError {
    /// The topology snapshot could not be read from the coordination store.
    #[error("topology snapshot unavailable: {0}")]
    SnapshotUnavailable(#[source] AgencyError),
    /// Not enough GOOD servers exist to carry the collection's replicas through the repair.
    #[error("collection {collection} needs {required} healthy servers, only {available} available")]
    InsufficientHealthyServers { collection: String, required: usize, available: usize },
    /// The deviation can not be fixed by the supported relocation pattern.
    #[error("collection {collection} is unrepairable: {reason}")]
    Unrepairable { collection: String, reason: String },
    /// A conditional write was rejected and reconciliation showed a genuine conflict.
    #[error("conflicting change detected for collection {collection}: {reason}")]
    PreconditionFailed { collection: String, reason: String },
    /// The relocation service could not complete a MoveShard step.
    #[error("moving shard {shard} from {from} to {to} failed after {attempts} attempt(s): {reason}")]
    RelocationFailed {
        shard: String,
        from: String,
        to: String,
        attempts: u32,
        reason: String,
    },
    /// A coordination store round trip failed while executing a step.
    #[error(transparent)]
    Agency(#[from] AgencyError),
    /// The repair was abandoned at a step boundary.
    #[error("repair cancelled")]
    Cancelled,
}

impl RepairError {
    /// Build an `Unrepairable` error.
    pub fn unrepairable(collection: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unrepairable {
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    /// Build a `PreconditionFailed` error.
    pub fn conflict(collection: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    /// A short stable label for this error, used for metrics & reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SnapshotUnavailable(_) => "snapshot_unavailable",
            Self::InsufficientHealthyServers { .. } => "insufficient_healthy_servers",
            Self::Unrepairable { .. } => "unrepairable",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::RelocationFailed { .. } => "relocation_failed",
            Self::Agency(_) => "agency",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A result type where the error is a `RepairError`.
pub type RepairResult<T> = ::std::result::Result<T, RepairError>;

/// A result type where the error is an `AgencyError`.
pub type AgencyResult<T> = ::std::result::Result<T, AgencyError>;
