//! Running test suites, either from the host or on a machine.
//!
//! A suite that runs and reports failures is an outcome, not an error:
//! [`TestOutcome::Failed`] carries the captured output for the caller to
//! report. Only failing to launch the runner is a [`TestExecutionError`].

use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::command::{CommandError, CommandOutput, CommandRunner, Shell};
use crate::registry::MachineId;
use crate::transport::Transport;

/// Result of a suite that ran to completion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestOutcome {
    /// The suite exited zero.
    Passed(CommandOutput),
    /// The suite ran and reported failures.
    Failed(CommandOutput),
}

impl TestOutcome {
    /// Classifies captured output by its exit code.
    #[must_use]
    pub fn from_output(output: CommandOutput) -> Self {
        if output.is_success() {
            Self::Passed(output)
        } else {
            Self::Failed(output)
        }
    }

    /// Whether the suite passed.
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self, Self::Passed(_))
    }

    /// Captured output.
    #[must_use]
    pub const fn output(&self) -> &CommandOutput {
        match self {
            Self::Passed(output) | Self::Failed(output) => output,
        }
    }
}

/// Raised when the test runner cannot be launched.
#[derive(Debug, Error)]
#[error("could not run tests on {target}: {source}")]
pub struct TestExecutionError {
    /// Machine name, or `host` for the external run.
    pub target: String,
    /// Underlying launch failure.
    #[source]
    pub source: CommandError,
}

/// Future returned by [`TestRunner`] methods.
pub type TestFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TestOutcome, TestExecutionError>> + Send + 'a>>;

/// Runs a suite from the host or a command on a machine.
pub trait TestRunner: Send + Sync {
    /// Runs the suite at `suite_path` from the host.
    fn run_suite_externally<'a>(&'a self, suite_path: &'a Utf8Path) -> TestFuture<'a>;

    /// Runs `command` on `machine` through `transport`.
    fn run_on_machine<'a>(
        &'a self,
        transport: &'a dyn Transport,
        machine: &'a MachineId,
        command: &'a str,
    ) -> TestFuture<'a>;
}

/// Label used for the host in logs and errors.
pub const HOST_TARGET: &str = "host";

/// Test runner that invokes `{test_command} {suite_path}` through the shell.
#[derive(Clone, Debug)]
pub struct CommandTestRunner<R> {
    shell: Shell<R>,
    test_command: String,
    kitchen_root: Utf8PathBuf,
}

impl<R: CommandRunner> CommandTestRunner<R> {
    /// Creates a runner executing `test_command` from `kitchen_root`.
    #[must_use]
    pub fn new(
        shell: Shell<R>,
        test_command: impl Into<String>,
        kitchen_root: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            shell,
            test_command: test_command.into(),
            kitchen_root: kitchen_root.into(),
        }
    }

    fn suite_command(&self, suite_path: &Utf8Path) -> String {
        format!(
            "{} {}",
            self.test_command,
            escape(suite_path.as_str().into())
        )
    }
}

impl<R> TestRunner for CommandTestRunner<R>
where
    R: CommandRunner + Send + Sync,
{
    fn run_suite_externally<'a>(&'a self, suite_path: &'a Utf8Path) -> TestFuture<'a> {
        Box::pin(async move {
            let command = self.suite_command(suite_path);
            info!(suite = %suite_path, "running suite from host");
            let output = self
                .shell
                .capture(&command, &self.kitchen_root)
                .await
                .map_err(|source| TestExecutionError {
                    target: String::from(HOST_TARGET),
                    source,
                })?;
            Ok(TestOutcome::from_output(output))
        })
    }

    fn run_on_machine<'a>(
        &'a self,
        transport: &'a dyn Transport,
        machine: &'a MachineId,
        command: &'a str,
    ) -> TestFuture<'a> {
        Box::pin(async move {
            info!(%machine, via = %transport.describe(), "running command on machine");
            let output = transport
                .execute(command)
                .await
                .map_err(|source| TestExecutionError {
                    target: machine.to_string(),
                    source,
                })?;
            Ok(TestOutcome::from_output(output))
        })
    }
}
