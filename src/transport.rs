//! Reaching a provisioned machine to run commands on it.
//!
//! Backends differ in how a machine is reached, so the lifecycle only sees
//! the [`Transport`] capability. [`SshTransport`] wraps the system `ssh`
//! client; its endpoint either comes from the provider (`vagrant ssh-config`)
//! or from addressing details recorded during converge.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use thiserror::Error;

use crate::command::{CommandFuture, CommandRunner, RunOptions};

/// Default SSH port used when a provider does not report one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection details for a machine reachable over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshEndpoint {
    /// Hostname or address to connect to.
    pub hostname: String,
    /// Login user, when the provider dictates one.
    pub username: Option<String>,
    /// TCP port of the SSH daemon.
    pub port: Option<u16>,
    /// Private key used for authentication.
    pub ssh_key: Option<String>,
}

impl SshEndpoint {
    /// Creates an endpoint for `hostname` with no other details.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: None,
            port: None,
            ssh_key: None,
        }
    }
}

/// Errors raised while interpreting provider SSH configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when the ssh-config output names no host.
    #[error("ssh-config output for {machine} is missing HostName")]
    MissingHostName {
        /// Machine whose configuration was parsed.
        machine: String,
    },
    /// Raised when the port is not a valid TCP port.
    #[error("ssh-config output for {machine} has invalid Port '{value}'")]
    InvalidPort {
        /// Machine whose configuration was parsed.
        machine: String,
        /// Raw port value.
        value: String,
    },
}

/// Splits `ssh-config` style output into key/value pairs.
///
/// Each line is split at its first space; double quotes are stripped from
/// the value. Later keys win over earlier ones.
#[must_use]
pub fn ssh_config_pairs(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            (key.to_owned(), value.trim().replace('"', ""))
        })
        .collect()
}

/// Parses `vagrant ssh-config` output into an [`SshEndpoint`].
///
/// # Errors
///
/// Returns [`TransportError`] when `HostName` is missing or `Port` is not a
/// number.
pub fn parse_ssh_config(machine: &str, text: &str) -> Result<SshEndpoint, TransportError> {
    let mut pairs = ssh_config_pairs(text);
    let hostname = pairs
        .remove("HostName")
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::MissingHostName {
            machine: machine.to_owned(),
        })?;
    let port = pairs
        .remove("Port")
        .map(|value| {
            value.parse::<u16>().map_err(|_| TransportError::InvalidPort {
                machine: machine.to_owned(),
                value,
            })
        })
        .transpose()?;

    Ok(SshEndpoint {
        hostname,
        username: pairs.remove("User"),
        port,
        ssh_key: pairs.remove("IdentityFile"),
    })
}

/// Capability to execute a command on one machine.
pub trait Transport: Send + Sync {
    /// Short description used in logs, for example `ssh vagrant@127.0.0.1:2222`.
    fn describe(&self) -> String;

    /// Executes `command` on the machine and captures its output.
    ///
    /// A non-zero exit is returned as output rather than an error.
    fn execute<'a>(&'a self, command: &'a str) -> CommandFuture<'a>;
}

const SSH_BIN: &str = "ssh";

/// Transport that shells out to the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshTransport<R> {
    runner: R,
    endpoint: SshEndpoint,
    default_user: String,
    timeout: Duration,
}

impl<R: CommandRunner> SshTransport<R> {
    /// Creates a transport; `default_user` applies when the endpoint names
    /// no user.
    #[must_use]
    pub fn new(
        runner: R,
        endpoint: SshEndpoint,
        default_user: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            endpoint,
            default_user: default_user.into(),
            timeout,
        }
    }

    /// Endpoint this transport connects to.
    #[must_use]
    pub const fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    fn user(&self) -> &str {
        self.endpoint
            .username
            .as_deref()
            .unwrap_or(&self.default_user)
    }

    pub(crate) fn build_ssh_args(&self, command: &str) -> Vec<OsString> {
        let port = self.endpoint.port.unwrap_or(DEFAULT_SSH_PORT);
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(port.to_string()),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
        ];
        if let Some(key) = &self.endpoint.ssh_key {
            args.push(OsString::from("-i"));
            args.push(OsString::from(key));
            args.push(OsString::from("-o"));
            args.push(OsString::from("IdentitiesOnly=yes"));
        }
        args.push(OsString::from(format!(
            "{}@{}",
            self.user(),
            self.endpoint.hostname
        )));
        args.push(OsString::from(command));
        args
    }
}

impl<R> Transport for SshTransport<R>
where
    R: CommandRunner + Send + Sync,
{
    fn describe(&self) -> String {
        format!(
            "ssh {}@{}:{}",
            self.user(),
            self.endpoint.hostname,
            self.endpoint.port.unwrap_or(DEFAULT_SSH_PORT)
        )
    }

    fn execute<'a>(&'a self, command: &'a str) -> CommandFuture<'a> {
        Box::pin(async move {
            let args = self.build_ssh_args(command);
            let options = RunOptions::new(self.timeout);
            self.runner.run(SSH_BIN, &args, &options).await
        })
    }
}
