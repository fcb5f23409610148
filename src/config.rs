//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::ServerSettings;
use crate::command::DEFAULT_COMMAND_TIMEOUT;

/// Driver settings layered from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KITCHEN_METAL",
    discovery(
        app_name = "kitchen-metal",
        env_var = "KITCHEN_METAL_CONFIG_PATH",
        config_file_name = "kitchen-metal.toml",
        dotfile_name = ".kitchen-metal.toml",
        project_file_name = "kitchen-metal.toml"
    )
)]
pub struct DriverConfig {
    /// Directory holding platform recipes and the `.kitchen` state folder.
    #[ortho_config(default = ".".to_owned())]
    pub kitchen_root: String,
    /// Driver recipe file, relative to the kitchen root.
    pub layout: Option<String>,
    /// Shell command run from the kitchen root before create.
    pub pre_create_command: Option<String>,
    /// Directory holding one test suite per suite name.
    #[ortho_config(default = "test/integration".to_owned())]
    pub test_base_path: String,
    /// Echo operator commands instead of running them.
    #[ortho_config(default = false)]
    pub dry_run: bool,
    /// Upper bound for any single external command, in seconds.
    #[ortho_config(default = 600)]
    pub command_timeout_secs: u64,
    /// Provisioning backend: `vagrant` or `metal`.
    #[ortho_config(default = "vagrant".to_owned())]
    pub provider: String,
    /// Converge engine executable.
    #[ortho_config(default = "kitchen-converge".to_owned())]
    pub engine_bin: String,
    /// Command that runs a suite from the host; the suite path is appended.
    #[ortho_config(default = "rspec".to_owned())]
    pub test_command: String,
    /// Command run on each targeted machine during setup.
    pub setup_command: Option<String>,
    /// Command run on each targeted machine during verify.
    pub verify_command: Option<String>,
    /// Local metadata server executable for the metal backend.
    pub server_bin: Option<String>,
    /// Port for the local metadata server.
    #[ortho_config(default = 8889)]
    pub server_port: u16,
    /// SSH user when the backend does not dictate one.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH private key for the metal backend.
    pub ssh_key: Option<String>,
}

/// Provisioning backend selected by [`DriverConfig::provider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provider {
    /// Vagrant machines reached over direct SSH.
    Vagrant,
    /// Metal provisioning through the converge engine.
    Metal,
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vagrant" => Ok(Self::Vagrant),
            "metal" => Ok(Self::Metal),
            other => Err(ConfigError::InvalidProvider {
                value: other.to_owned(),
            }),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl DriverConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kitchen-metal")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to kitchen-metal.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty, the provider
    /// is unknown, or the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.kitchen_root,
            &FieldMetadata::new("kitchen root", "KITCHEN_METAL_KITCHEN_ROOT", "kitchen_root"),
        )?;
        Self::require_field(
            &self.engine_bin,
            &FieldMetadata::new("converge engine", "KITCHEN_METAL_ENGINE_BIN", "engine_bin"),
        )?;
        Self::require_field(
            &self.test_command,
            &FieldMetadata::new("test command", "KITCHEN_METAL_TEST_COMMAND", "test_command"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "KITCHEN_METAL_SSH_USER", "ssh_user"),
        )?;
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        self.provider()?;
        Ok(())
    }

    /// Selected provisioning backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidProvider`] for unknown names.
    pub fn provider(&self) -> Result<Provider, ConfigError> {
        self.provider.parse()
    }

    /// Kitchen root as a UTF-8 path.
    #[must_use]
    pub fn kitchen_root(&self) -> &Utf8Path {
        Utf8Path::new(&self.kitchen_root)
    }

    /// Upper bound for a single external command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        if self.command_timeout_secs == 0 {
            DEFAULT_COMMAND_TIMEOUT
        } else {
            Duration::from_secs(self.command_timeout_secs)
        }
    }

    /// Directory the converge engine writes recipe files to.
    #[must_use]
    pub fn engine_work_dir(&self, instance_name: &str) -> Utf8PathBuf {
        self.kitchen_root()
            .join(".kitchen")
            .join("kitchen-metal")
            .join(instance_name)
    }

    /// Local metadata server settings, when a server is configured.
    #[must_use]
    pub fn server_settings(&self) -> Option<ServerSettings> {
        self.server_bin
            .as_deref()
            .filter(|bin| !bin.trim().is_empty())
            .map(|bin| ServerSettings::new(bin, self.server_port))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised for an unknown provider name.
    #[error(
        "unknown provider '{value}': set KITCHEN_METAL_PROVIDER or provider in kitchen-metal.toml to vagrant or metal"
    )]
    InvalidProvider {
        /// Rejected provider name.
        value: String,
    },
    /// Raised when the command timeout is zero.
    #[error("command_timeout_secs must be greater than zero")]
    InvalidTimeout,
    /// Raised when a structured setting cannot be parsed.
    #[error("invalid {field} entry '{entry}': {message}")]
    InvalidEntry {
        /// Setting being parsed.
        field: &'static str,
        /// Offending entry.
        entry: String,
        /// What was expected.
        message: &'static str,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
