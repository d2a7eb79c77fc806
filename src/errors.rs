use thiserror::Error;

use crate::models::OperationKind;
use crate::orchestrator::OrchestratorState;

/// Failures surfaced synchronously by the run orchestrator. Everything here is
/// raised before any state changes, except `Store`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("a {operation} run is already {state}; stop it before starting another")]
    AlreadyActive {
        operation: OperationKind,
        state: OrchestratorState,
    },

    #[error(
        "{operation} run #{run_id} is still marked in progress; resume it with --resume {run_id} or run `jobpilot runs reconcile {run_id}`"
    )]
    StaleRun { operation: OperationKind, run_id: i64 },

    #[error("run #{0} not found")]
    RunNotFound(i64),

    #[error("run #{0} already completed and cannot be resumed")]
    RunCompleted(i64),

    #[error("run #{run_id} is a {found} run, not {expected}")]
    WrongOperation {
        run_id: i64,
        expected: OperationKind,
        found: OperationKind,
    },

    #[error("run #{0} is owned by a live process; use `jobpilot runs stop {0}` to stop it")]
    RunActive(i64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for RunError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Store(error.into())
    }
}
