//! Command-line interface definitions for the `kitchen-metal` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `kitchen-metal` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kitchen-metal",
    about = "Drive test-kitchen instances on Vagrant or metal provisioning",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the pre-create command and converge the environment.
    #[command(name = "create", about = "Run the pre-create command and converge the environment")]
    Create(InstanceArgs),
    /// Converge the environment.
    #[command(name = "converge", about = "Converge the environment")]
    Converge(InstanceArgs),
    /// Converge, then run the setup command on targeted machines.
    #[command(name = "setup", about = "Run the setup command on targeted machines")]
    Setup(InstanceArgs),
    /// Converge, then run the test suite.
    #[command(name = "verify", about = "Run the test suite on targeted machines or the host")]
    Verify(InstanceArgs),
    /// Destroy every recorded machine.
    #[command(name = "destroy", about = "Destroy every recorded machine")]
    Destroy(InstanceArgs),
}

impl Cli {
    /// Arguments shared by every subcommand.
    pub(crate) const fn instance_args(&self) -> &InstanceArgs {
        match self {
            Self::Create(args)
            | Self::Converge(args)
            | Self::Setup(args)
            | Self::Verify(args)
            | Self::Destroy(args) => args,
        }
    }
}

/// Identifies the instance an action applies to.
#[derive(Debug, Args)]
pub(crate) struct InstanceArgs {
    /// Instance name; defaults to `{suite}-{platform}`.
    #[arg(long, value_name = "NAME")]
    pub(crate) instance: Option<String>,
    /// Platform name; also the platform recipe file under the kitchen root.
    #[arg(long, value_name = "PLATFORM", default_value = "default")]
    pub(crate) platform: String,
    /// Suite name; selects the test directory under the test base path.
    #[arg(long, value_name = "SUITE", default_value = "default")]
    pub(crate) suite: String,
    /// Machines setup and verify act on: a machine name, `all`, or `none`.
    #[arg(long, value_name = "TARGET")]
    pub(crate) target: Option<String>,
    /// State file; defaults to `.kitchen/{instance}.json` under the kitchen root.
    #[arg(long, value_name = "PATH")]
    pub(crate) state: Option<String>,
}

impl InstanceArgs {
    /// Instance name, derived from suite and platform when not given.
    pub(crate) fn instance_name(&self) -> String {
        self.instance
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", self.suite, self.platform))
    }
}
