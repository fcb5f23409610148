//! External process execution with bounded timeouts.
//!
//! Every call to the virtualization CLI, the converge engine, or a test
//! command goes through [`CommandRunner`] so tests can substitute scripted
//! doubles. The process-backed runner never waits forever: each invocation
//! carries a timeout and an optional cancellation token, and a process that
//! overruns either is killed with whatever output it produced so far
//! attached to the error.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;

/// Default upper bound for a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status, `unknown` when the process was signalled.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }

    /// Converts a non-zero exit into [`CommandError::Failure`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failure`] when the exit code is not zero.
    pub fn ensure_success(self, program: &str) -> Result<Self, CommandError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(CommandError::Failure {
            program: program.to_owned(),
            status_text: self.status_text(),
            stderr: self.stderr,
        })
    }
}

/// Per-invocation execution options.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Working directory for the process; inherits the caller's when unset.
    pub cwd: Option<Utf8PathBuf>,
    /// Upper bound on the wall-clock time of the process.
    pub timeout: Duration,
    /// Token that aborts the process when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    /// Creates options with the given timeout and no working directory.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            cwd: None,
            timeout,
            cancel: None,
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn in_dir(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

/// Errors raised while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when waiting on a spawned process fails.
    #[error("failed to wait for {program}: {message}")]
    Wait {
        /// Command being waited on.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command exits with a non-zero status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failure {
        /// Command that failed.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when a command exceeds its timeout and is killed.
    #[error("{program} did not finish within {timeout_secs} seconds")]
    TimedOut {
        /// Command that overran.
        program: String,
        /// Timeout that was applied.
        timeout_secs: u64,
        /// Output captured before the process was killed.
        partial: CommandOutput,
    },
    /// Raised when the caller cancels a running command.
    #[error("{program} was cancelled")]
    Cancelled {
        /// Command that was aborted.
        program: String,
        /// Output captured before the process was killed.
        partial: CommandOutput,
    },
}

impl CommandError {
    /// Output captured before an interrupted process was killed.
    #[must_use]
    pub const fn partial_output(&self) -> Option<&CommandOutput> {
        match self {
            Self::TimedOut { partial, .. } | Self::Cancelled { partial, .. } => Some(partial),
            Self::Spawn { .. } | Self::Wait { .. } | Self::Failure { .. } => None,
        }
    }
}

/// Future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, CommandError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// Implementations return `Ok` for any process that exits, whatever its
    /// status; callers decide whether a non-zero exit is fatal.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: &'a RunOptions,
    ) -> CommandFuture<'a>;
}

/// Real command runner backed by `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

/// Time allowed for output readers to drain after a forced kill.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

enum Exit {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

type Captured = Arc<Mutex<Vec<u8>>>;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: &'a RunOptions,
    ) -> CommandFuture<'a> {
        Box::pin(async move {
            let deadline = Instant::now() + options.timeout;
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            #[cfg(unix)]
            command.process_group(0);
            if let Some(cwd) = &options.cwd {
                command.current_dir(cwd);
            }

            let mut child = command.spawn().map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
            let stdout_buf = Captured::default();
            let stderr_buf = Captured::default();
            let stdout_task = tokio::spawn(read_stream(child.stdout.take(), Arc::clone(&stdout_buf)));
            let stderr_task = tokio::spawn(read_stream(child.stderr.take(), Arc::clone(&stderr_buf)));

            let exit = tokio::select! {
                status = child.wait() => Exit::Exited(status),
                () = sleep_until(deadline) => Exit::TimedOut,
                () = cancellation(options.cancel.as_ref()) => Exit::Cancelled,
            };
            let drain_until = if matches!(exit, Exit::Exited(_)) {
                deadline.max(Instant::now() + DRAIN_GRACE)
            } else {
                kill_process_group(child.id());
                child.kill().await.ok();
                Instant::now() + DRAIN_GRACE
            };

            join_reader(stdout_task, drain_until).await;
            join_reader(stderr_task, drain_until).await;
            let stdout = take_captured(&stdout_buf);
            let stderr = take_captured(&stderr_buf);

            match exit {
                Exit::Exited(Ok(status)) => Ok(CommandOutput {
                    code: status.code(),
                    stdout,
                    stderr,
                }),
                Exit::Exited(Err(err)) => Err(CommandError::Wait {
                    program: program.to_owned(),
                    message: err.to_string(),
                }),
                Exit::TimedOut => Err(CommandError::TimedOut {
                    program: program.to_owned(),
                    timeout_secs: options.timeout.as_secs(),
                    partial: CommandOutput {
                        code: None,
                        stdout,
                        stderr,
                    },
                }),
                Exit::Cancelled => Err(CommandError::Cancelled {
                    program: program.to_owned(),
                    partial: CommandOutput {
                        code: None,
                        stdout,
                        stderr,
                    },
                }),
            }
        })
    }
}

/// Kills every process in the child's group, including grandchildren that
/// still hold the output pipes.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: `killpg` only sends a signal; the group was created for this
    // child by `process_group(0)`.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
const fn kill_process_group(_pid: Option<u32>) {}

async fn read_stream<S>(stream: Option<S>, sink: Captured)
where
    S: AsyncRead + Unpin,
{
    let Some(mut reader) = stream else {
        return;
    };
    let mut chunk = [0_u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                if let Some(bytes) = chunk.get(..read) {
                    lock_buffer(&sink).extend_from_slice(bytes);
                }
            }
        }
    }
}

/// Waits for a reader until `until`, abandoning it when a lingering
/// process keeps the pipe open.
async fn join_reader(mut task: JoinHandle<()>, until: Instant) {
    if timeout_at(until, &mut task).await.is_err() {
        task.abort();
    }
}

fn lock_buffer(buffer: &Captured) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_captured(buffer: &Captured) -> String {
    String::from_utf8_lossy(&std::mem::take(&mut *lock_buffer(buffer))).into_owned()
}

async fn cancellation(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

/// Runs operator-supplied shell commands, honouring dry-run mode.
///
/// In dry-run mode the command is echoed instead of executed, so the
/// operator sees exactly what would have run.
#[derive(Clone, Debug)]
pub struct Shell<R> {
    runner: R,
    shell_bin: String,
    dry_run: bool,
    timeout: Duration,
}

impl<R: CommandRunner> Shell<R> {
    /// Creates a shell wrapper around `runner` using `/bin/sh`.
    #[must_use]
    pub fn new(runner: R, dry_run: bool, timeout: Duration) -> Self {
        Self {
            runner,
            shell_bin: String::from("sh"),
            dry_run,
            timeout,
        }
    }

    /// Returns the wrapped runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Whether commands are echoed rather than executed.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Runs `command` through the shell in `cwd` and requires a zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the shell cannot be spawned, times out,
    /// or the command exits non-zero.
    pub async fn run(&self, command: &str, cwd: &Utf8Path) -> Result<CommandOutput, CommandError> {
        let output = self.capture(command, cwd).await?;
        output.ensure_success(&self.shell_bin)
    }

    /// Runs `command` through the shell in `cwd`, returning its output
    /// whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the shell cannot be spawned or times
    /// out.
    pub async fn capture(
        &self,
        command: &str,
        cwd: &Utf8Path,
    ) -> Result<CommandOutput, CommandError> {
        let args = self.shell_args(command);
        let options = RunOptions::new(self.timeout).in_dir(cwd);
        self.runner.run(&self.shell_bin, &args, &options).await
    }

    pub(crate) fn shell_args(&self, command: &str) -> Vec<OsString> {
        let script = if self.dry_run {
            format!("echo {}", escape(command.into()))
        } else {
            command.to_owned()
        };
        vec![OsString::from("-c"), OsString::from(script)]
    }
}
