//! Vagrant backend: machines reached over direct SSH.
//!
//! Machines are declared through a generated cluster recipe and managed
//! with the `vagrant` CLI from a per-instance root under
//! `.kitchen/kitchen-vagrant-metal`. Connection details come from
//! `vagrant ssh-config` and are persisted into the instance state.

use std::ffi::OsString;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BackendFuture, BackendSession, ProvisioningBackend, ServerError};
use crate::command::{CommandError, CommandOutput, CommandRunner, RunOptions};
use crate::engine::ConvergeAction;
use crate::recipe::{FragmentOrigin, RecipeFragment};
use crate::registry::{MachineId, MachineInfo};
use crate::transport::{SshEndpoint, SshTransport, Transport, TransportError, parse_ssh_config};

mod config;
mod recipe;

pub use config::{
    BENTO_BASE_URL, DEFAULT_PROVIDER, Network, SyncedFolder, VagrantConfig, VagrantSettings,
    default_box_url,
};
pub use recipe::{cluster_recipe, ruby_string, vagrant_config_text, vagrant_options};

/// Oldest supported Vagrant release.
pub const MIN_VAGRANT_VERSION: &str = "1.1.0";

/// Where to download Vagrant from.
pub const VAGRANT_WEBSITE: &str = "http://downloads.vagrantup.com/";

/// Errors raised by the Vagrant backend.
#[derive(Debug, Error)]
pub enum VagrantError {
    /// Raised when the `vagrant` executable cannot be run.
    #[error("Vagrant {minimum} or higher is not installed ({message}); download a package from {VAGRANT_WEBSITE}")]
    NotInstalled {
        /// Oldest supported version.
        minimum: &'static str,
        /// Launch failure.
        message: String,
    },
    /// Raised when the installed Vagrant is too old.
    #[error("detected an old version of Vagrant ({found}); upgrade to {minimum} or higher from {VAGRANT_WEBSITE}")]
    Outdated {
        /// Installed version.
        found: String,
        /// Oldest supported version.
        minimum: &'static str,
    },
    /// Raised when `vagrant --version` output has no version number.
    #[error("could not read a version from `vagrant --version` output '{output}'")]
    UnreadableVersion {
        /// Raw output.
        output: String,
    },
    /// Raised when a `vagrant` command fails.
    #[error("vagrant {operation} failed: {source}")]
    Command {
        /// Operation being performed, for example `destroy web1`.
        operation: String,
        /// Underlying command failure.
        #[source]
        source: CommandError,
    },
    /// Raised when `vagrant ssh-config` output cannot be used.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Raised when the Vagrant root cannot be created.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Directory being created.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the session's local server cannot be stopped.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Parses the last whitespace-separated token of `vagrant --version` output
/// into numeric components.
#[must_use]
pub fn parse_vagrant_version(output: &str) -> Option<Vec<u64>> {
    let token = output.split_whitespace().last()?;
    let components = token
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u64>().ok()
        })
        .collect::<Option<Vec<_>>>()?;
    (!components.is_empty()).then_some(components)
}

/// Whether `found` is at least `minimum`, comparing missing components as
/// zero.
#[must_use]
pub fn version_at_least(found: &[u64], minimum: &[u64]) -> bool {
    let width = found.len().max(minimum.len());
    let pad = |parts: &[u64]| {
        let mut padded = parts.to_vec();
        padded.resize(width, 0);
        padded
    };
    pad(found) >= pad(minimum)
}

/// Vagrant provisioning backend for one instance.
#[derive(Clone, Debug)]
pub struct VagrantBackend<R> {
    runner: R,
    settings: VagrantSettings,
    vagrant_root: Utf8PathBuf,
    default_user: String,
    timeout: Duration,
}

impl<R> VagrantBackend<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    /// Creates a backend for `instance_name` rooted under `kitchen_root`.
    #[must_use]
    pub fn new(
        runner: R,
        settings: VagrantSettings,
        kitchen_root: &Utf8Path,
        instance_name: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            settings,
            vagrant_root: Self::root_for(kitchen_root, instance_name),
            default_user: String::from("vagrant"),
            timeout,
        }
    }

    /// `{kitchen_root}/.kitchen/kitchen-vagrant-metal/{instance_name}`.
    #[must_use]
    pub fn root_for(kitchen_root: &Utf8Path, instance_name: &str) -> Utf8PathBuf {
        kitchen_root
            .join(".kitchen")
            .join("kitchen-vagrant-metal")
            .join(instance_name)
    }

    /// Directory Vagrant commands run in.
    #[must_use]
    pub fn vagrant_root(&self) -> &Utf8Path {
        &self.vagrant_root
    }

    /// Resolved settings.
    #[must_use]
    pub const fn settings(&self) -> &VagrantSettings {
        &self.settings
    }

    async fn vagrant(
        &self,
        args: &[&str],
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandOutput, CommandError> {
        let args: Vec<OsString> = args.iter().map(OsString::from).collect();
        let mut options = RunOptions::new(self.timeout).in_dir(self.vagrant_root.clone());
        if let Some(token) = cancel {
            options = options.cancelled_by(token.clone());
        }
        self.runner
            .run(&self.settings.vagrant_bin, &args, &options)
            .await
    }

    /// Checks that an acceptable Vagrant is installed.
    ///
    /// # Errors
    ///
    /// Returns [`VagrantError`] when Vagrant is missing, too old, or reports
    /// an unreadable version.
    pub async fn check_version(&self) -> Result<String, VagrantError> {
        let args = [OsString::from("--version")];
        let output = self
            .runner
            .run(&self.settings.vagrant_bin, &args, &RunOptions::new(self.timeout))
            .await
            .and_then(|output| output.ensure_success(&self.settings.vagrant_bin))
            .map_err(|err| VagrantError::NotInstalled {
                minimum: MIN_VAGRANT_VERSION,
                message: err.to_string(),
            })?;
        let raw = output.stdout.trim();
        let found = parse_vagrant_version(raw).ok_or_else(|| VagrantError::UnreadableVersion {
            output: raw.to_owned(),
        })?;
        let minimum = parse_vagrant_version(MIN_VAGRANT_VERSION).unwrap_or_default();
        let version = raw.split_whitespace().last().unwrap_or(raw).to_owned();
        if !version_at_least(&found, &minimum) {
            return Err(VagrantError::Outdated {
                found: version,
                minimum: MIN_VAGRANT_VERSION,
            });
        }
        Ok(version)
    }

    fn prepare_root(&self) -> Result<(), VagrantError> {
        Dir::create_ambient_dir_all(&self.vagrant_root, ambient_authority()).map_err(
            |err: io::Error| VagrantError::Io {
                path: self.vagrant_root.clone(),
                message: err.to_string(),
            },
        )
    }

    async fn ssh_config(&self, machine: &MachineId) -> Result<SshEndpoint, VagrantError> {
        let output = self
            .vagrant(&["ssh-config", machine.as_str()], None)
            .await
            .and_then(|output| output.ensure_success(&self.settings.vagrant_bin))
            .map_err(|source| VagrantError::Command {
                operation: format!("ssh-config {machine}"),
                source,
            })?;
        Ok(parse_ssh_config(machine.as_str(), &output.stdout)?)
    }
}

impl<R> ProvisioningBackend for VagrantBackend<R>
where
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    type Error = VagrantError;

    fn name(&self) -> &'static str {
        "vagrant"
    }

    fn connect(&self) -> BackendFuture<'_, BackendSession, Self::Error> {
        Box::pin(async move {
            let version = self.check_version().await?;
            self.prepare_root()?;
            info!(%version, root = %self.vagrant_root, "vagrant backend ready");
            Ok(BackendSession::new())
        })
    }

    fn release(&self, session: BackendSession) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move { session.shutdown().await.map_err(VagrantError::from) })
    }

    fn destroy_machine<'a>(
        &'a self,
        _session: &'a BackendSession,
        machine: &'a MachineId,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            debug!(%machine, "vagrant destroy");
            self.vagrant(&["destroy", "-f", machine.as_str()], Some(cancel))
                .await
                .and_then(|output| output.ensure_success(&self.settings.vagrant_bin))
                .map_err(|source| VagrantError::Command {
                    operation: format!("destroy {machine}"),
                    source,
                })?;
            Ok(())
        })
    }

    fn transport<'a>(
        &'a self,
        _session: &'a BackendSession,
        machine: &'a MachineId,
        _info: Option<&'a MachineInfo>,
    ) -> BackendFuture<'a, Box<dyn Transport>, Self::Error> {
        Box::pin(async move {
            let endpoint = self.ssh_config(machine).await?;
            let transport: Box<dyn Transport> = Box::new(SshTransport::new(
                self.runner.clone(),
                endpoint,
                self.default_user.clone(),
                self.timeout,
            ));
            Ok(transport)
        })
    }

    fn connection_details<'a>(
        &'a self,
        _session: &'a BackendSession,
        machine: &'a MachineId,
    ) -> BackendFuture<'a, Option<SshEndpoint>, Self::Error> {
        Box::pin(async move { Ok(Some(self.ssh_config(machine).await?)) })
    }

    fn layout_fragment(&self, action: ConvergeAction) -> Option<RecipeFragment> {
        Some(RecipeFragment::generated(
            FragmentOrigin::Driver,
            cluster_recipe(&self.vagrant_root, &self.settings, action),
        ))
    }
}
