//! Environment lifecycle: create, converge, setup, verify and destroy.
//!
//! Every operation opens one backend session, converges the environment
//! when it has not converged yet, performs its own work, and releases the
//! session on every path. State is owned by the caller and mutated in place
//! so machines salvaged from a failed apply are never lost.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendSession, ProvisioningBackend};
use crate::command::{CommandRunner, Shell};
use crate::config::DriverConfig;
use crate::dispatch::{Target, TargetSpec, dispatch};
use crate::engine::{ConvergeAction, ConvergeContext, ConvergeEngine, DeclaredResource};
use crate::instance::Instance;
use crate::recipe::RecipeComposer;
use crate::registry::{MachineId, MachineInfo};
use crate::state::InstanceState;
use crate::suite::{HOST_TARGET, TestOutcome, TestRunner};

mod error;

pub use error::{DestroyError, LifecycleError, MachineFailure};

/// Operator settings consumed by the lifecycle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LifecycleSettings {
    /// Directory recipes and suites are resolved against.
    pub kitchen_root: Utf8PathBuf,
    /// Layout recipe file, relative to `kitchen_root`.
    pub layout: Option<String>,
    /// Shell command run before create.
    pub pre_create_command: Option<String>,
    /// Directory holding one test directory per suite.
    pub test_base_path: Utf8PathBuf,
    /// Command run on each targeted machine during setup.
    pub setup_command: Option<String>,
    /// Command run on each targeted machine during verify.
    pub verify_command: Option<String>,
}

impl LifecycleSettings {
    /// Extracts lifecycle settings from the driver configuration.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            kitchen_root: config.kitchen_root().to_owned(),
            layout: config.layout.clone(),
            pre_create_command: config.pre_create_command.clone(),
            test_base_path: Utf8PathBuf::from(&config.test_base_path),
            setup_command: config.setup_command.clone(),
            verify_command: config.verify_command.clone(),
        }
    }

    /// Path of the suite run from the host: `{test_base_path}/{suite_name}`.
    #[must_use]
    pub fn suite_path(&self, suite_name: &str) -> Utf8PathBuf {
        self.test_base_path.join(suite_name)
    }
}

/// Outcome of a suite on one target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetOutcome {
    /// Where the suite ran.
    pub target: Target,
    /// What the suite reported.
    pub outcome: TestOutcome,
}

impl TargetOutcome {
    /// Machine name, or `host` for the external run.
    #[must_use]
    pub fn label(&self) -> &str {
        match &self.target {
            Target::Machine(machine) => machine.as_str(),
            Target::External => HOST_TARGET,
        }
    }
}

/// Per-target results of a verify pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VerifyReport {
    /// One entry per target, in dispatch order.
    pub outcomes: Vec<TargetOutcome>,
    /// Machine targets that ran nothing because no verify command is set.
    pub skipped: Vec<MachineId>,
}

impl VerifyReport {
    /// Whether every target passed.
    ///
    /// An empty report passes; a report with skipped machines does not,
    /// since selected targets went untested.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.skipped.is_empty() && self.outcomes.iter().all(|entry| entry.outcome.passed())
    }

    /// Targets whose suite reported failures.
    pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|entry| !entry.outcome.passed())
    }
}

/// Drives one instance through its lifecycle.
#[derive(Debug)]
pub struct Lifecycle<B, E, T, R> {
    instance: Instance,
    backend: B,
    engine: E,
    tests: T,
    shell: Shell<R>,
    composer: RecipeComposer,
    settings: LifecycleSettings,
    cancel: CancellationToken,
}

type LifecycleResult<V, B> = Result<V, LifecycleError<<B as ProvisioningBackend>::Error>>;

impl<B, E, T, R> Lifecycle<B, E, T, R>
where
    B: ProvisioningBackend,
    E: ConvergeEngine,
    T: TestRunner,
    R: CommandRunner,
{
    /// Creates a lifecycle for `instance`.
    #[must_use]
    pub fn new(
        instance: Instance,
        backend: B,
        engine: E,
        tests: T,
        shell: Shell<R>,
        settings: LifecycleSettings,
    ) -> Self {
        let composer = RecipeComposer::new(settings.kitchen_root.clone(), settings.layout.clone());
        Self {
            instance,
            backend,
            engine,
            tests,
            shell,
            composer,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to cancel in-flight applies and destroys.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token observed by in-flight work.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Instance this lifecycle acts on.
    #[must_use]
    pub const fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Runs the pre-create command, then converges the environment.
    ///
    /// Direct-SSH backends also write the first machine's connection
    /// details into `state`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the pre-create command, the backend,
    /// recipe composition, or the apply fails.
    pub async fn create(&self, state: &mut InstanceState) -> LifecycleResult<(), B> {
        self.run_pre_create().await?;
        let session = self.connect().await?;
        let result = self.create_in_session(&session, state).await;
        self.finish(session, result).await
    }

    /// Converges the environment without the pre-create hook.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the backend, recipe composition, or
    /// the apply fails.
    pub async fn converge(&self, state: &mut InstanceState) -> LifecycleResult<(), B> {
        let session = self.connect().await?;
        let result = self
            .apply_in_session(&session, state, ConvergeAction::Converge)
            .await
            .map(|_| ());
        self.finish(session, result).await
    }

    /// Converges, then runs the setup command on every targeted machine.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SetupFailed`] for the first machine whose
    /// setup command exits non-zero, and other variants when converging or
    /// dispatch fails.
    pub async fn setup(&self, state: &mut InstanceState) -> LifecycleResult<(), B> {
        let spec = self.instance.target_spec()?;
        let session = self.connect().await?;
        let result = self.setup_in_session(&session, state, &spec).await;
        self.finish(session, result).await
    }

    /// Converges, then runs the verify command on every targeted machine,
    /// or the suite from the host when no target is configured.
    ///
    /// Failing suites are reported in the [`VerifyReport`], not raised.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when converging, dispatch, or launching a
    /// suite fails.
    pub async fn verify(&self, state: &mut InstanceState) -> LifecycleResult<VerifyReport, B> {
        let spec = self.instance.target_spec()?;
        let session = self.connect().await?;
        let result = self.verify_in_session(&session, state, &spec).await;
        self.finish(session, result).await
    }

    /// Destroys every recorded machine.
    ///
    /// Never contacts the backend when nothing was created. Failures do not
    /// stop the pass; machines that could not be destroyed stay recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Destroy`] listing every machine that could
    /// not be destroyed, and [`LifecycleError::Cancelled`] when cancelled
    /// between machines.
    pub async fn destroy(&self, state: &mut InstanceState) -> LifecycleResult<(), B> {
        if !state.is_created() || state.machines.is_empty() {
            if state.is_created() {
                state.finish_destroy();
            }
            info!(instance = %self.instance.name, "nothing to destroy");
            return Ok(());
        }
        let session = self.connect().await?;
        let result = self.destroy_in_session(&session, state).await;
        self.finish(session, result).await
    }

    async fn run_pre_create(&self) -> LifecycleResult<(), B> {
        let Some(command) = self
            .settings
            .pre_create_command
            .as_deref()
            .filter(|command| !command.trim().is_empty())
        else {
            return Ok(());
        };
        info!(%command, dry_run = self.shell.is_dry_run(), "running pre-create command");
        self.shell
            .run(command, &self.settings.kitchen_root)
            .await
            .map_err(|source| LifecycleError::PreCreate {
                command: command.to_owned(),
                source,
            })?;
        Ok(())
    }

    async fn connect(&self) -> LifecycleResult<BackendSession, B> {
        debug!(backend = self.backend.name(), "connecting to backend");
        self.backend
            .connect()
            .await
            .map_err(|source| LifecycleError::Provisioning {
                backend: self.backend.name(),
                source,
            })
    }

    async fn finish<V>(
        &self,
        session: BackendSession,
        result: LifecycleResult<V, B>,
    ) -> LifecycleResult<V, B> {
        match (result, self.backend.release(session).await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(source)) => Err(LifecycleError::Release {
                backend: self.backend.name(),
                source,
            }),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(error = %release_err, "failed to release backend session");
                Err(err)
            }
        }
    }

    async fn create_in_session(
        &self,
        session: &BackendSession,
        state: &mut InstanceState,
    ) -> LifecycleResult<(), B> {
        self.apply_in_session(session, state, ConvergeAction::Create)
            .await?;
        if state.hostname.is_some() {
            return Ok(());
        }
        let Some(first) = state.machines.iter().next().cloned() else {
            return Ok(());
        };
        let endpoint = self
            .backend
            .connection_details(session, &first)
            .await
            .map_err(|source| LifecycleError::Backend {
                backend: self.backend.name(),
                operation: format!("read connection details of {first}"),
                source,
            })?;
        if let Some(endpoint) = endpoint {
            info!(machine = %first, host = %endpoint.hostname, "recording ssh endpoint");
            state.apply_endpoint(&endpoint);
        }
        Ok(())
    }

    /// Applies the recipe set unless the environment already converged.
    ///
    /// Returns whether an apply ran.
    async fn apply_in_session(
        &self,
        session: &BackendSession,
        state: &mut InstanceState,
        action: ConvergeAction,
    ) -> LifecycleResult<bool, B> {
        if state.is_converged() {
            debug!(%action, "environment already converged; skipping apply");
            return Ok(false);
        }
        let recipes = self.composer.compose_with(
            &self.instance.platform_name,
            self.backend.layout_fragment(action),
        )?;
        let context = ConvergeContext {
            server_url: session.server_url(),
            cancel: self.cancel.clone(),
        };
        info!(instance = %self.instance.name, %action, "applying recipes");
        match self.engine.apply(&recipes, action, &context).await {
            Ok(resources) => {
                state.record_converged(machine_records(&resources));
                info!(machines = state.machines.len(), "environment converged");
                Ok(true)
            }
            Err(failure) => {
                let records = machine_records(&failure.declared);
                let salvaged = records
                    .iter()
                    .map(|(machine, _)| machine)
                    .collect::<BTreeSet<_>>()
                    .len();
                state.record_partial(records);
                warn!(%action, salvaged, error = %failure, "apply did not complete");
                if failure.cancelled || self.cancel.is_cancelled() {
                    Err(LifecycleError::Cancelled {
                        action,
                        salvaged,
                        failures: Vec::new(),
                    })
                } else {
                    Err(LifecycleError::Converge {
                        action,
                        salvaged,
                        source: failure,
                    })
                }
            }
        }
    }

    async fn setup_in_session(
        &self,
        session: &BackendSession,
        state: &mut InstanceState,
        spec: &TargetSpec,
    ) -> LifecycleResult<(), B> {
        self.apply_in_session(session, state, ConvergeAction::Setup)
            .await?;
        let machines = machine_targets(dispatch(spec, &state.machines)?);
        let Some(command) = self.settings.setup_command.as_deref() else {
            if !machines.is_empty() {
                debug!(targets = machines.len(), "no setup command configured");
            }
            return Ok(());
        };
        for machine in machines {
            let outcome = self.run_on(session, state, &machine, command).await?;
            if let TestOutcome::Failed(output) = outcome {
                return Err(LifecycleError::SetupFailed {
                    status_text: output.status_text(),
                    stderr: output.stderr,
                    machine,
                });
            }
            info!(%machine, "setup complete");
        }
        Ok(())
    }

    async fn verify_in_session(
        &self,
        session: &BackendSession,
        state: &mut InstanceState,
        spec: &TargetSpec,
    ) -> LifecycleResult<VerifyReport, B> {
        self.apply_in_session(session, state, ConvergeAction::Verify)
            .await?;
        let mut targets = dispatch(spec, &state.machines)?;
        if matches!(spec, TargetSpec::None) {
            targets.push(Target::External);
        }
        let mut report = VerifyReport::default();
        for target in targets {
            let outcome = match &target {
                Target::Machine(machine) => {
                    let Some(command) = self.settings.verify_command.as_deref() else {
                        warn!(%machine, "no verify command configured; skipping machine");
                        report.skipped.push(machine.clone());
                        continue;
                    };
                    self.run_on(session, state, machine, command).await?
                }
                Target::External => {
                    let suite_path = self.settings.suite_path(&self.instance.suite_name);
                    self.tests.run_suite_externally(&suite_path).await?
                }
            };
            let entry = TargetOutcome { target, outcome };
            info!(target = entry.label(), passed = entry.outcome.passed(), "suite finished");
            report.outcomes.push(entry);
        }
        Ok(report)
    }

    async fn run_on(
        &self,
        session: &BackendSession,
        state: &InstanceState,
        machine: &MachineId,
        command: &str,
    ) -> LifecycleResult<TestOutcome, B> {
        let transport = self
            .backend
            .transport(session, machine, state.machine_info.get(machine.as_str()))
            .await
            .map_err(|source| LifecycleError::Backend {
                backend: self.backend.name(),
                operation: format!("open a transport to {machine}"),
                source,
            })?;
        Ok(self
            .tests
            .run_on_machine(transport.as_ref(), machine, command)
            .await?)
    }

    async fn destroy_in_session(
        &self,
        session: &BackendSession,
        state: &mut InstanceState,
    ) -> LifecycleResult<(), B> {
        let machines: Vec<MachineId> = state.machines.iter().cloned().collect();
        let attempted = machines.len();
        let mut failures = Vec::new();
        for machine in machines {
            if self.cancel.is_cancelled() {
                state.finish_destroy();
                return Err(LifecycleError::Cancelled {
                    action: ConvergeAction::Destroy,
                    salvaged: state.machines.len(),
                    failures,
                });
            }
            match self
                .backend
                .destroy_machine(session, &machine, &self.cancel)
                .await
            {
                Ok(()) => {
                    info!(%machine, "machine destroyed");
                    state.forget_machine(&machine);
                }
                Err(err) => {
                    warn!(%machine, error = %err, "failed to destroy machine");
                    failures.push(MachineFailure {
                        machine,
                        message: err.to_string(),
                    });
                }
            }
        }
        state.finish_destroy();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DestroyError {
                attempted,
                failures,
            }
            .into())
        }
    }
}

fn machine_records(resources: &[DeclaredResource]) -> Vec<(MachineId, MachineInfo)> {
    resources
        .iter()
        .filter(|resource| resource.is_machine())
        .filter_map(|resource| {
            let machine = MachineId::new(resource.name.as_str()).ok()?;
            let info = MachineInfo::from_attributes(machine.as_str(), &resource.attributes);
            Some((machine, info))
        })
        .collect()
}

fn machine_targets(targets: Vec<Target>) -> Vec<MachineId> {
    targets
        .into_iter()
        .filter_map(|target| match target {
            Target::Machine(machine) => Some(machine),
            Target::External => None,
        })
        .collect()
}

#[cfg(test)]
mod tests;
