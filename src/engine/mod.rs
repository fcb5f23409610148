//! Boundary to the external converge engine.
//!
//! The lifecycle never interprets recipes itself. It hands a [`RecipeSet`]
//! to a [`ConvergeEngine`] tagged with the current action and gets back the
//! resources the engine declared. Only `machine` resources matter to the
//! lifecycle; everything else is ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::recipe::RecipeSet;

mod command;

pub use command::{CommandConvergeEngine, EngineSettings};

/// Resource kind the engine uses for provisioned machines.
pub const MACHINE_KIND: &str = "machine";

/// Lifecycle action an apply is performed for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConvergeAction {
    /// Initial provisioning.
    Create,
    /// Re-application of configuration.
    Converge,
    /// Preparation before tests.
    Setup,
    /// Test execution.
    Verify,
    /// Teardown.
    Destroy,
}

impl ConvergeAction {
    /// Tag passed to the engine.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Converge => "converge",
            Self::Setup => "setup",
            Self::Verify => "verify",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for ConvergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Resource declared by the engine during an apply.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DeclaredResource {
    /// Resource type, for example `machine` or `file`.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Attributes reported for the resource.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl DeclaredResource {
    /// Creates a resource with no attributes.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Creates a `machine` resource with no attributes.
    #[must_use]
    pub fn machine(name: impl Into<String>) -> Self {
        Self::new(MACHINE_KIND, name)
    }

    /// Whether the resource is a provisioned machine.
    #[must_use]
    pub fn is_machine(&self) -> bool {
        self.kind == MACHINE_KIND
    }
}

/// Per-apply inputs that are not part of the recipe itself.
#[derive(Clone, Debug, Default)]
pub struct ConvergeContext {
    /// URL of the local metadata server, when the session runs one.
    pub server_url: Option<String>,
    /// Token that aborts the apply.
    pub cancel: CancellationToken,
}

/// Failure reported by the engine, carrying what it applied before failing.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct ConvergeFailure {
    /// Description of the failure.
    pub message: String,
    /// Resources applied before the failure.
    pub declared: Vec<DeclaredResource>,
    /// Whether the apply stopped because it was cancelled.
    pub cancelled: bool,
}

impl ConvergeFailure {
    /// Creates a failure that salvaged `declared`.
    #[must_use]
    pub fn new(message: impl Into<String>, declared: Vec<DeclaredResource>) -> Self {
        Self {
            message: message.into(),
            declared,
            cancelled: false,
        }
    }

    /// Creates a cancellation that salvaged `declared`.
    #[must_use]
    pub fn cancelled(message: impl Into<String>, declared: Vec<DeclaredResource>) -> Self {
        Self {
            cancelled: true,
            ..Self::new(message, declared)
        }
    }
}

/// Future returned by [`ConvergeEngine::apply`].
pub type EngineFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<DeclaredResource>, ConvergeFailure>> + Send + 'a>>;

/// Applies recipe sets and reports declared resources.
pub trait ConvergeEngine: Send + Sync {
    /// Applies `recipes` for `action`.
    ///
    /// On failure the returned [`ConvergeFailure`] must still list every
    /// resource applied before the failure point.
    fn apply<'a>(
        &'a self,
        recipes: &'a RecipeSet,
        action: ConvergeAction,
        context: &'a ConvergeContext,
    ) -> EngineFuture<'a>;
}
