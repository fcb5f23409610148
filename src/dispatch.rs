//! Selection of the machines setup and verify act on.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::registry::{MachineId, MachineRegistry};

/// Provisioner configuration key naming the target.
pub const TARGET_KEY: &str = "target";

/// Errors raised while resolving targets.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DispatchError {
    /// Raised when a named target is not a recorded machine.
    #[error("target machine '{name}' not found among known machines [{}]", .known.join(", "))]
    TargetNotFound {
        /// Requested machine name.
        name: String,
        /// Machines currently recorded.
        known: Vec<String>,
    },
    /// Raised when the target setting is neither a string nor null.
    #[error("invalid target setting {value}: expected a machine name, \"all\", or \"none\"")]
    InvalidTargetSpec {
        /// Rendered JSON value.
        value: String,
    },
}

/// Operator choice of which machines to act on.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum TargetSpec {
    /// No machine; verify runs the suite externally instead.
    #[default]
    None,
    /// One named machine.
    Node(String),
    /// Every recorded machine.
    All,
}

impl TargetSpec {
    /// Parses a textual target setting.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "none" => Self::None,
            "all" => Self::All,
            name => Self::Node(name.to_owned()),
        }
    }

    /// Reads the target setting from a provisioner configuration map.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidTargetSpec`] when the value is not a
    /// string or null.
    pub fn from_config(config: &Map<String, Value>) -> Result<Self, DispatchError> {
        match config.get(TARGET_KEY) {
            None | Some(Value::Null) => Ok(Self::None),
            Some(Value::String(value)) => Ok(Self::parse(value)),
            Some(other) => Err(DispatchError::InvalidTargetSpec {
                value: other.to_string(),
            }),
        }
    }
}

/// Something setup or verify can run against.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// A recorded machine.
    Machine(MachineId),
    /// No machine; the suite runs from the host.
    External,
}

/// Resolves `spec` against the recorded machines.
///
/// [`TargetSpec::None`] yields no machine targets; callers that need the
/// external pass add [`Target::External`] themselves.
///
/// # Errors
///
/// Returns [`DispatchError::TargetNotFound`] when a named machine is not
/// recorded.
pub fn dispatch(spec: &TargetSpec, machines: &MachineRegistry) -> Result<Vec<Target>, DispatchError> {
    match spec {
        TargetSpec::None => Ok(Vec::new()),
        TargetSpec::Node(name) => machines
            .get(name)
            .map(|machine| vec![Target::Machine(machine.clone())])
            .ok_or_else(|| DispatchError::TargetNotFound {
                name: name.clone(),
                known: machines.names(),
            }),
        TargetSpec::All => Ok(machines.iter().cloned().map(Target::Machine).collect()),
    }
}
