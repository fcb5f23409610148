//! Vagrant settings and their resolution against an instance.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::instance::Instance;

/// Vagrant provider used when neither configuration nor
/// `VAGRANT_DEFAULT_PROVIDER` names one.
pub const DEFAULT_PROVIDER: &str = "virtualbox";

/// Base URL of the bento box bucket.
pub const BENTO_BASE_URL: &str = "https://opscode-vm-bento.s3.amazonaws.com/vagrant";

/// Vagrant settings layered via `OrthoConfig`.
///
/// `networks`, `synced_folders`, and `customize` use compact text forms so
/// they can come from environment variables as well as files:
///
/// - `networks`: `;`-separated entries of `type, option, option`, for
///   example `private_network, ip: "192.168.33.10"`.
/// - `synced_folders`: `;`-separated entries of `source:destination[:options]`;
///   `%{instance_name}` is replaced in source and destination.
/// - `customize`: `,`-separated `key=value` pairs.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KITCHEN_METAL_VAGRANT",
    discovery(
        app_name = "kitchen-metal",
        env_var = "KITCHEN_METAL_CONFIG_PATH",
        config_file_name = "kitchen-metal.toml",
        dotfile_name = ".kitchen-metal.toml",
        project_file_name = "kitchen-metal.toml"
    )
)]
pub struct VagrantConfig {
    /// Path to the `vagrant` executable.
    #[ortho_config(default = "vagrant".to_owned())]
    pub vagrant_bin: String,
    /// Vagrant provider, for example `virtualbox` or `vmware_fusion`.
    pub provider: Option<String>,
    /// Box name; defaults to `opscode-{platform}`.
    pub box_name: Option<String>,
    /// Box URL; defaults to the bento bucket for the provider.
    pub box_url: Option<String>,
    /// Machine hostname; defaults to `{instance}.vagrantup.com`.
    pub vm_hostname: Option<String>,
    /// Guest OS type (`vm.guest`).
    pub guest: Option<String>,
    /// SSH user (`ssh.username`).
    pub username: Option<String>,
    /// SSH private key (`ssh.private_key_path`).
    pub ssh_key: Option<String>,
    /// Network declarations.
    pub networks: Option<String>,
    /// Synced folder declarations.
    pub synced_folders: Option<String>,
    /// Provider customisations.
    pub customize: Option<String>,
}

/// One `config.vm.network` declaration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Network {
    /// Network type, for example `private_network`.
    pub kind: String,
    /// Ruby option fragments passed through verbatim.
    pub options: Vec<String>,
}

/// One `config.vm.synced_folder` declaration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncedFolder {
    /// Host path.
    pub source: String,
    /// Guest path.
    pub destination: String,
    /// Ruby options passed through verbatim.
    pub options: Option<String>,
}

/// Vagrant settings resolved for one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VagrantSettings {
    /// Path to the `vagrant` executable.
    pub vagrant_bin: String,
    /// Vagrant provider.
    pub provider: String,
    /// Box name.
    pub box_name: String,
    /// Box URL.
    pub box_url: String,
    /// Machine hostname.
    pub vm_hostname: String,
    /// Guest OS type.
    pub guest: Option<String>,
    /// SSH user.
    pub username: Option<String>,
    /// SSH private key.
    pub ssh_key: Option<String>,
    /// Network declarations.
    pub networks: Vec<Network>,
    /// Synced folders with `%{instance_name}` already substituted.
    pub synced_folders: Vec<SyncedFolder>,
    /// Provider customisations.
    pub customize: BTreeMap<String, String>,
}

/// Default box URL for `platform` on `provider`.
///
/// All `vmware_*` providers share the `vmware` bucket.
#[must_use]
pub fn default_box_url(provider: &str, platform: &str) -> String {
    let bucket = if provider.starts_with("vmware_") {
        "vmware"
    } else {
        provider
    };
    format!("{BENTO_BASE_URL}/{bucket}/opscode_{platform}_chef-provisionerless.box")
}

impl VagrantConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kitchen-metal")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Resolves defaults that depend on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEntry`] when a network, synced folder,
    /// or customisation entry is malformed.
    pub fn resolve(&self, instance: &Instance) -> Result<VagrantSettings, ConfigError> {
        let provider = non_blank(self.provider.as_deref())
            .map(str::to_owned)
            .or_else(|| env::var("VAGRANT_DEFAULT_PROVIDER").ok())
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| String::from(DEFAULT_PROVIDER));
        let box_name = non_blank(self.box_name.as_deref()).map_or_else(
            || format!("opscode-{}", instance.platform_name),
            str::to_owned,
        );
        let box_url = non_blank(self.box_url.as_deref()).map_or_else(
            || default_box_url(&provider, &instance.platform_name),
            str::to_owned,
        );
        let vm_hostname = non_blank(self.vm_hostname.as_deref()).map_or_else(
            || format!("{}.vagrantup.com", instance.name),
            str::to_owned,
        );

        Ok(VagrantSettings {
            vagrant_bin: self.vagrant_bin.clone(),
            provider,
            box_name,
            box_url,
            vm_hostname,
            guest: non_blank(self.guest.as_deref()).map(str::to_owned),
            username: non_blank(self.username.as_deref()).map(str::to_owned),
            ssh_key: non_blank(self.ssh_key.as_deref()).map(str::to_owned),
            networks: parse_networks(self.networks.as_deref().unwrap_or_default())?,
            synced_folders: parse_synced_folders(
                self.synced_folders.as_deref().unwrap_or_default(),
                &instance.name,
            )?,
            customize: parse_customize(self.customize.as_deref().unwrap_or_default())?,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn entries(text: &str, separator: char) -> impl Iterator<Item = &str> {
    text.split(separator)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
}

fn parse_networks(text: &str) -> Result<Vec<Network>, ConfigError> {
    entries(text, ';')
        .map(|entry| {
            let mut parts = entry.split(',').map(str::trim);
            let kind = parts
                .next()
                .filter(|kind| !kind.is_empty())
                .ok_or_else(|| ConfigError::InvalidEntry {
                    field: "networks",
                    entry: entry.to_owned(),
                    message: "expected a network type first",
                })?;
            Ok(Network {
                kind: kind.trim_start_matches(':').to_owned(),
                options: parts
                    .filter(|part| !part.is_empty())
                    .map(str::to_owned)
                    .collect(),
            })
        })
        .collect()
}

fn parse_synced_folders(text: &str, instance_name: &str) -> Result<Vec<SyncedFolder>, ConfigError> {
    entries(text, ';')
        .map(|entry| {
            let mut parts = entry.splitn(3, ':').map(str::trim);
            let (Some(source), Some(destination)) = (parts.next(), parts.next()) else {
                return Err(ConfigError::InvalidEntry {
                    field: "synced_folders",
                    entry: entry.to_owned(),
                    message: "expected source:destination[:options]",
                });
            };
            if source.is_empty() || destination.is_empty() {
                return Err(ConfigError::InvalidEntry {
                    field: "synced_folders",
                    entry: entry.to_owned(),
                    message: "source and destination must not be empty",
                });
            }
            Ok(SyncedFolder {
                source: source.replace("%{instance_name}", instance_name),
                destination: destination.replace("%{instance_name}", instance_name),
                options: parts
                    .next()
                    .filter(|options| !options.is_empty())
                    .map(str::to_owned),
            })
        })
        .collect()
}

fn parse_customize(text: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    entries(text, ',')
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| ConfigError::InvalidEntry {
                    field: "customize",
                    entry: entry.to_owned(),
                    message: "expected key=value",
                })
        })
        .collect()
}
