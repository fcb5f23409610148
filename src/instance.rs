//! Description of the instance a lifecycle call acts on.

use serde_json::{Map, Value};

use crate::dispatch::{DispatchError, TARGET_KEY, TargetSpec};

/// Instance under test: a platform and suite pairing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Instance {
    /// Instance name, usually `{suite}-{platform}`.
    pub name: String,
    /// Platform name; also the platform recipe file name.
    pub platform_name: String,
    /// Suite name; selects the external test directory.
    pub suite_name: String,
    /// Provisioner configuration, consulted for the target setting.
    pub provisioner_config: Map<String, Value>,
}

impl Instance {
    /// Creates an instance with an empty provisioner configuration.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        platform_name: impl Into<String>,
        suite_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            platform_name: platform_name.into(),
            suite_name: suite_name.into(),
            provisioner_config: Map::new(),
        }
    }

    /// Sets the provisioner target setting.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.provisioner_config
            .insert(String::from(TARGET_KEY), Value::String(target.into()));
        self
    }

    /// Target setting from the provisioner configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidTargetSpec`] when the setting is not a
    /// string.
    pub fn target_spec(&self) -> Result<TargetSpec, DispatchError> {
        TargetSpec::from_config(&self.provisioner_config)
    }
}
