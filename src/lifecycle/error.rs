//! Error types for lifecycle operations.

use std::fmt;

use thiserror::Error;

use crate::command::CommandError;
use crate::dispatch::DispatchError;
use crate::engine::{ConvergeAction, ConvergeFailure};
use crate::recipe::RecipeError;
use crate::registry::MachineId;
use crate::suite::TestExecutionError;

/// One machine that could not be destroyed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineFailure {
    /// Machine that is still recorded.
    pub machine: MachineId,
    /// Backend error message.
    pub message: String,
}

impl fmt::Display for MachineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.machine, self.message)
    }
}

/// Aggregate of per-machine destroy failures.
///
/// Raised only after every recorded machine was attempted.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to destroy {} of {attempted} machines: {}", .failures.len(), render(.failures))]
pub struct DestroyError {
    /// Number of machines a destroy was attempted for.
    pub attempted: usize,
    /// Machines that failed and remain recorded.
    pub failures: Vec<MachineFailure>,
}

fn render(failures: &[MachineFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn earlier(failures: &[MachineFailure]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!("; earlier failures: {}", render(failures))
    }
}

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError<BackendError>
where
    BackendError: std::error::Error + 'static,
{
    /// Raised when the pre-create command fails.
    #[error("pre-create command '{command}' failed: {source}")]
    PreCreate {
        /// Command that was run.
        command: String,
        /// Underlying command failure.
        #[source]
        source: CommandError,
    },
    /// Raised when the backend cannot be reached or started.
    #[error("provisioning backend {backend} unavailable: {source}")]
    Provisioning {
        /// Backend name.
        backend: &'static str,
        /// Backend specific error.
        #[source]
        source: BackendError,
    },
    /// Raised when a backend call other than connect fails.
    #[error("{backend} backend failed to {operation}: {source}")]
    Backend {
        /// Backend name.
        backend: &'static str,
        /// Operation that failed, naming the machine.
        operation: String,
        /// Backend specific error.
        #[source]
        source: BackendError,
    },
    /// Raised when the platform recipe cannot be read.
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    /// Raised when the engine fails mid-apply; salvaged machines are already
    /// recorded.
    #[error("{action} apply failed after declaring {salvaged} machine(s): {source}")]
    Converge {
        /// Action being applied.
        action: ConvergeAction,
        /// Machines recorded from the partial apply.
        salvaged: usize,
        /// Engine failure.
        #[source]
        source: ConvergeFailure,
    },
    /// Raised when the caller cancels an operation; salvaged machines are
    /// already recorded.
    #[error("{action} cancelled; {salvaged} machine(s) recorded for destroy{}", earlier(.failures))]
    Cancelled {
        /// Action being performed.
        action: ConvergeAction,
        /// Machines recorded in state.
        salvaged: usize,
        /// Destroy failures seen before the cancellation.
        failures: Vec<MachineFailure>,
    },
    /// Raised when targets cannot be resolved.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Raised when the setup command fails on a machine.
    #[error("setup command failed on {machine} with status {status_text}: {stderr}")]
    SetupFailed {
        /// Machine the command ran on.
        machine: MachineId,
        /// Exit status of the command.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when tests cannot be launched.
    #[error(transparent)]
    Tests(#[from] TestExecutionError),
    /// Raised when one or more machines could not be destroyed.
    #[error(transparent)]
    Destroy(#[from] DestroyError),
    /// Raised when the backend session cannot be released after an
    /// otherwise successful operation.
    #[error("failed to release {backend} session: {source}")]
    Release {
        /// Backend name.
        backend: &'static str,
        /// Backend specific error.
        #[source]
        source: BackendError,
    },
}
