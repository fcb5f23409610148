//! Test support utilities shared across unit and integration tests.
//!
//! The doubles record every interaction behind `Arc<Mutex<_>>` so clones
//! handed to the code under test share state with the clone the test keeps
//! for assertions.

use std::collections::{BTreeSet, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendFuture, BackendSession, ProvisioningBackend};
use crate::command::{CommandError, CommandFuture, CommandOutput, CommandRunner, RunOptions};
use crate::engine::{
    ConvergeAction, ConvergeContext, ConvergeEngine, ConvergeFailure, DeclaredResource,
    EngineFuture,
};
use crate::recipe::{RecipeFragment, RecipeSet};
use crate::registry::{MachineId, MachineInfo};
use crate::transport::{SshEndpoint, SshTransport, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// An exhausted queue answers with [`CommandError::Spawn`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Result<CommandOutput, CommandError>>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory requested by the caller.
    pub cwd: Option<Utf8PathBuf>,
    /// Timeout requested by the caller.
    pub timeout: Duration,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes an execution error such as a timeout.
    pub fn push_error(&self, error: CommandError) {
        lock(&self.responses).push_back(Err(error));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: &'a RunOptions,
    ) -> CommandFuture<'a> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            cwd: options.cwd.clone(),
            timeout: options.timeout,
        });
        let response = lock(&self.responses).pop_front();
        Box::pin(async move {
            response.unwrap_or_else(|| {
                Err(CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
        })
    }
}

/// One apply recorded by [`ScriptedEngine`].
#[derive(Clone, Debug, PartialEq)]
pub struct EngineCall {
    /// Action the apply was tagged with.
    pub action: ConvergeAction,
    /// Rendered recipe set.
    pub rendered: String,
    /// Fragment sources in evaluation order.
    pub sources: Vec<String>,
    /// Server URL passed in the context.
    pub server_url: Option<String>,
}

/// Scripted converge engine returning queued results in FIFO order.
///
/// An exhausted queue answers with an empty successful apply.
#[derive(Clone, Debug, Default)]
pub struct ScriptedEngine {
    results: Arc<Mutex<VecDeque<Result<Vec<DeclaredResource>, ConvergeFailure>>>>,
    calls: Arc<Mutex<Vec<EngineCall>>>,
}

impl ScriptedEngine {
    /// Creates an engine with no queued results.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful apply declaring `resources`.
    pub fn push_resources(&self, resources: Vec<DeclaredResource>) {
        lock(&self.results).push_back(Ok(resources));
    }

    /// Queues a successful apply declaring machines named `names`.
    pub fn push_machines(&self, names: &[&str]) {
        self.push_resources(names.iter().map(|name| DeclaredResource::machine(*name)).collect());
    }

    /// Queues a failed apply.
    pub fn push_failure(&self, failure: ConvergeFailure) {
        lock(&self.results).push_back(Err(failure));
    }

    /// Recorded applies.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }
}

impl ConvergeEngine for ScriptedEngine {
    fn apply<'a>(
        &'a self,
        recipes: &'a RecipeSet,
        action: ConvergeAction,
        context: &'a ConvergeContext,
    ) -> EngineFuture<'a> {
        lock(&self.calls).push(EngineCall {
            action,
            rendered: recipes.render(),
            sources: recipes
                .fragments()
                .map(|fragment| fragment.source.clone())
                .collect(),
            server_url: context.server_url.clone(),
        });
        let result = lock(&self.results).pop_front().unwrap_or_else(|| Ok(Vec::new()));
        Box::pin(async move { result })
    }
}

/// Errors produced by [`ScriptedBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedBackendError {
    /// Raised when connecting was scripted to fail.
    #[error("scripted backend unreachable")]
    Unreachable,
    /// Raised when destroying a machine was scripted to fail.
    #[error("scripted destroy of {machine} failed")]
    DestroyFailed {
        /// Machine whose destroy failed.
        machine: String,
    },
}

#[derive(Debug, Default)]
struct BackendLog {
    connects: usize,
    releases: usize,
    destroyed: Vec<String>,
    destroy_attempts: Vec<String>,
    transports: Vec<String>,
}

#[derive(Debug, Default)]
struct BackendScript {
    fail_connect: bool,
    fail_destroy: BTreeSet<String>,
    cancel_after_destroy: Option<String>,
    endpoint: Option<SshEndpoint>,
    layout: Option<RecipeFragment>,
}

/// Scripted provisioning backend recording every call.
///
/// Transports are [`SshTransport`]s over the shared [`ScriptedRunner`], so
/// commands run on machines are scripted through [`Self::runner`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<BackendScript>>,
    log: Arc<Mutex<BackendLog>>,
    runner: ScriptedRunner,
}

impl ScriptedBackend {
    /// Creates a backend where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes [`ProvisioningBackend::connect`] fail.
    pub fn fail_connect(&self) {
        lock(&self.script).fail_connect = true;
    }

    /// Makes destroying `machine` fail.
    pub fn fail_destroy_of(&self, machine: &str) {
        lock(&self.script).fail_destroy.insert(machine.to_owned());
    }

    /// Cancels the caller's token once destroying `machine` was attempted.
    pub fn cancel_after_destroy_of(&self, machine: &str) {
        lock(&self.script).cancel_after_destroy = Some(machine.to_owned());
    }

    /// Reports `endpoint` as direct-SSH connection details.
    pub fn set_endpoint(&self, endpoint: SshEndpoint) {
        lock(&self.script).endpoint = Some(endpoint);
    }

    /// Supplies a generated layout fragment.
    pub fn set_layout(&self, fragment: RecipeFragment) {
        lock(&self.script).layout = Some(fragment);
    }

    /// Runner behind the transports this backend hands out.
    #[must_use]
    pub const fn runner(&self) -> &ScriptedRunner {
        &self.runner
    }

    /// Number of sessions opened.
    #[must_use]
    pub fn connects(&self) -> usize {
        lock(&self.log).connects
    }

    /// Number of sessions released.
    #[must_use]
    pub fn releases(&self) -> usize {
        lock(&self.log).releases
    }

    /// Machines destroyed successfully, in call order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.log).destroyed.clone()
    }

    /// Machines a destroy was attempted for, in call order.
    #[must_use]
    pub fn destroy_attempts(&self) -> Vec<String> {
        lock(&self.log).destroy_attempts.clone()
    }

    /// Machines a transport was requested for, in call order.
    #[must_use]
    pub fn transports(&self) -> Vec<String> {
        lock(&self.log).transports.clone()
    }
}

impl ProvisioningBackend for ScriptedBackend {
    type Error = ScriptedBackendError;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn connect(&self) -> BackendFuture<'_, BackendSession, Self::Error> {
        let result = if lock(&self.script).fail_connect {
            Err(ScriptedBackendError::Unreachable)
        } else {
            lock(&self.log).connects += 1;
            Ok(BackendSession::new())
        };
        Box::pin(async move { result })
    }

    fn release(&self, session: BackendSession) -> BackendFuture<'_, (), Self::Error> {
        drop(session);
        lock(&self.log).releases += 1;
        Box::pin(async { Ok(()) })
    }

    fn destroy_machine<'a>(
        &'a self,
        _session: &'a BackendSession,
        machine: &'a MachineId,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, (), Self::Error> {
        let name = machine.as_str().to_owned();
        lock(&self.log).destroy_attempts.push(name.clone());
        let script = lock(&self.script);
        if script.cancel_after_destroy.as_deref() == Some(name.as_str()) {
            cancel.cancel();
        }
        let fails = script.fail_destroy.contains(&name);
        drop(script);
        let result = if fails {
            Err(ScriptedBackendError::DestroyFailed { machine: name })
        } else {
            lock(&self.log).destroyed.push(name);
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn transport<'a>(
        &'a self,
        _session: &'a BackendSession,
        machine: &'a MachineId,
        info: Option<&'a MachineInfo>,
    ) -> BackendFuture<'a, Box<dyn Transport>, Self::Error> {
        lock(&self.log).transports.push(machine.as_str().to_owned());
        let address = info.map_or_else(|| machine.as_str().to_owned(), |info| info.address().to_owned());
        let transport: Box<dyn Transport> = Box::new(SshTransport::new(
            self.runner.clone(),
            SshEndpoint::new(address),
            "root",
            Duration::from_secs(5),
        ));
        Box::pin(async move { Ok(transport) })
    }

    fn connection_details<'a>(
        &'a self,
        _session: &'a BackendSession,
        _machine: &'a MachineId,
    ) -> BackendFuture<'a, Option<SshEndpoint>, Self::Error> {
        let endpoint = lock(&self.script).endpoint.clone();
        Box::pin(async move { Ok(endpoint) })
    }

    fn layout_fragment(&self, _action: ConvergeAction) -> Option<RecipeFragment> {
        lock(&self.script).layout.clone()
    }
}
