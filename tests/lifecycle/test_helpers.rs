//! Shared fixtures for lifecycle BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use kitchen_metal::test_support::{ScriptedBackend, ScriptedEngine, ScriptedRunner};
use kitchen_metal::{
    CommandTestRunner, Instance, InstanceState, Lifecycle, LifecycleSettings, Shell, VerifyReport,
};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

pub const PLATFORM: &str = "ubuntu-22.04";

pub type ScriptedLifecycle =
    Lifecycle<ScriptedBackend, ScriptedEngine, CommandTestRunner<ScriptedRunner>, ScriptedRunner>;

/// Result of the last lifecycle action.
#[derive(Clone, Debug)]
pub enum LifecycleResult {
    Success(Option<VerifyReport>),
    Failure(String),
}

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub backend: ScriptedBackend,
    pub engine: ScriptedEngine,
    pub host: ScriptedRunner,
    pub instance: Instance,
    pub settings: LifecycleSettings,
    pub state: InstanceState,
    pub outcome: Option<LifecycleResult>,
    pub(crate) root: Arc<TempDir>,
}

impl LifecycleContext {
    pub fn lifecycle(&self) -> ScriptedLifecycle {
        let shell = Shell::new(self.host.clone(), false, Duration::from_secs(5));
        let tests = CommandTestRunner::new(shell.clone(), "rspec", self.settings.kitchen_root.clone());
        Lifecycle::new(
            self.instance.clone(),
            self.backend.clone(),
            self.engine.clone(),
            tests,
            shell,
            self.settings.clone(),
        )
    }
}

#[derive(Clone, Debug, Error)]
pub enum LifecycleTestError {
    #[error("invalid lifecycle fixture: {0}")]
    Fixture(String),
}

#[fixture]
pub fn lifecycle_context_result() -> Result<LifecycleContext, LifecycleTestError> {
    build_lifecycle_context()
}

#[fixture]
pub fn lifecycle_context(
    lifecycle_context_result: Result<LifecycleContext, LifecycleTestError>,
) -> LifecycleContext {
    lifecycle_context_result
        .unwrap_or_else(|err| panic!("lifecycle context fixture should initialise: {err}"))
}

fn build_lifecycle_context() -> Result<LifecycleContext, LifecycleTestError> {
    let dir = TempDir::new().map_err(|err| LifecycleTestError::Fixture(err.to_string()))?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .map_err(|path| LifecycleTestError::Fixture(format!("non UTF-8 path {}", path.display())))?;
    Ok(LifecycleContext {
        backend: ScriptedBackend::new(),
        engine: ScriptedEngine::new(),
        host: ScriptedRunner::new(),
        instance: Instance::new("default-ubuntu", PLATFORM, "default"),
        settings: LifecycleSettings {
            kitchen_root: root,
            test_base_path: Utf8PathBuf::from("test/integration"),
            ..LifecycleSettings::default()
        },
        state: InstanceState::default(),
        outcome: None,
        root: Arc::new(dir),
    })
}

/// Splits a comma-separated list of machine names.
pub fn names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}
