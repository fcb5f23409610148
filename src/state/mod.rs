//! Caller-owned instance state shared across lifecycle calls.
//!
//! The state is deliberately a plain serialisable record: the host tool owns
//! it, hands it to every lifecycle call, and persists it between processes.
//! Keys this crate does not know about are kept verbatim so other drivers
//! sharing the same state file do not lose data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::{MachineCatalog, MachineId, MachineInfo, MachineRegistry};
use crate::transport::SshEndpoint;

mod store;

pub use store::{StateStore, StateStoreError};

/// Position of an environment in its lifecycle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentPhase {
    /// Nothing has been converged yet.
    #[default]
    Uninitialized,
    /// An apply failed or was cancelled after declaring some machines.
    Partial,
    /// The environment converged successfully.
    Created,
    /// The environment was torn down; converging again re-creates it.
    Destroyed,
}

/// Mutable state owned by the caller and threaded through lifecycle calls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Lifecycle phase of the environment.
    #[serde(default)]
    pub phase: EnvironmentPhase,
    /// Machines that exist and must be destroyed.
    #[serde(default)]
    pub machines: MachineRegistry,
    /// Addressing details for each recorded machine.
    #[serde(default, skip_serializing_if = "MachineCatalog::is_empty")]
    pub machine_info: MachineCatalog,
    /// SSH host written by direct-SSH backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// SSH user written by direct-SSH backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// SSH private key path written by direct-SSH backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    /// SSH port written by direct-SSH backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Keys owned by other tooling, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceState {
    /// Whether an environment exists that destroy should clean up.
    ///
    /// Recorded machines always count, whatever the phase says, so state
    /// written without a `phase` key still has its machines torn down.
    #[must_use]
    pub fn is_created(&self) -> bool {
        !self.machines.is_empty()
            || matches!(
                self.phase,
                EnvironmentPhase::Created | EnvironmentPhase::Partial
            )
    }

    /// Whether the last apply completed, making further converges no-ops.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        matches!(self.phase, EnvironmentPhase::Created)
    }

    /// Records the machines declared by a completed apply.
    pub fn record_converged(&mut self, machines: impl IntoIterator<Item = (MachineId, MachineInfo)>) {
        self.record_machines(machines);
        self.phase = EnvironmentPhase::Created;
    }

    /// Records machines salvaged from a failed or cancelled apply.
    ///
    /// The environment counts as created only when something was salvaged,
    /// so destroy stays a no-op for an apply that declared nothing.
    pub fn record_partial(&mut self, machines: impl IntoIterator<Item = (MachineId, MachineInfo)>) {
        self.record_machines(machines);
        if !self.machines.is_empty() {
            self.phase = EnvironmentPhase::Partial;
        }
    }

    fn record_machines(&mut self, machines: impl IntoIterator<Item = (MachineId, MachineInfo)>) {
        for (machine, info) in machines {
            self.machine_info.insert(info);
            self.machines.record(machine);
        }
    }

    /// Forgets a machine that has been destroyed.
    pub fn forget_machine(&mut self, machine: &MachineId) {
        self.machines.forget(machine);
        self.machine_info.remove(machine.as_str());
    }

    /// Settles the phase after a destroy pass.
    pub fn finish_destroy(&mut self) {
        if self.machines.is_empty() {
            self.phase = EnvironmentPhase::Destroyed;
            self.machine_info.clear();
            self.clear_connection();
        } else {
            self.phase = EnvironmentPhase::Partial;
        }
    }

    /// Writes direct-SSH connection details.
    pub fn apply_endpoint(&mut self, endpoint: &SshEndpoint) {
        self.hostname = Some(endpoint.hostname.clone());
        self.username.clone_from(&endpoint.username);
        self.ssh_key.clone_from(&endpoint.ssh_key);
        self.port = endpoint.port;
    }

    /// Removes direct-SSH connection details.
    pub fn clear_connection(&mut self) {
        self.hostname = None;
        self.username = None;
        self.ssh_key = None;
        self.port = None;
    }
}
