//! Core library for the kitchen-metal test-kitchen driver.
//!
//! An instance's environment is a set of machines declared by recipes and
//! applied by a converge engine. The [`Lifecycle`] drives that environment
//! through create, converge, setup, verify and destroy against a
//! [`ProvisioningBackend`]: Vagrant machines reached over direct SSH, or
//! metal provisioning backed by an optional local metadata server. Machines
//! are tracked in caller-owned [`InstanceState`] so a later process can tear
//! down what an earlier one created.

pub mod backend;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod instance;
pub mod lifecycle;
pub mod metal;
pub mod recipe;
pub mod registry;
pub mod state;
pub mod suite;
#[cfg(test)]
pub mod test_helpers;
pub mod test_support;
pub mod transport;
pub mod vagrant;

pub use backend::{BackendSession, LocalServer, ProvisioningBackend, ServerSettings};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner, Shell};
pub use config::{ConfigError, DriverConfig, Provider};
pub use dispatch::{DispatchError, Target, TargetSpec, dispatch};
pub use engine::{
    CommandConvergeEngine, ConvergeAction, ConvergeEngine, ConvergeFailure, DeclaredResource,
    EngineSettings,
};
pub use instance::Instance;
pub use lifecycle::{
    DestroyError, Lifecycle, LifecycleError, LifecycleSettings, MachineFailure, TargetOutcome,
    VerifyReport,
};
pub use metal::{MetalBackend, MetalError};
pub use recipe::{RecipeComposer, RecipeError, RecipeFragment, RecipeSet};
pub use registry::{MachineId, MachineInfo, MachineRegistry};
pub use state::{EnvironmentPhase, InstanceState, StateStore, StateStoreError};
pub use suite::{CommandTestRunner, TestExecutionError, TestOutcome, TestRunner};
pub use transport::{SshEndpoint, SshTransport, Transport};
pub use vagrant::{VagrantBackend, VagrantConfig, VagrantError, VagrantSettings};
