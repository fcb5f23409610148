//! Provisioning backends and the session resource they hand out.
//!
//! A backend turns declared machines into real ones and knows how to reach
//! and remove them. Every lifecycle operation that talks to a backend holds
//! a [`BackendSession`] for its duration and hands it back through
//! [`ProvisioningBackend::release`] on every exit path, so background
//! servers never outlive the call.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::engine::ConvergeAction;
use crate::recipe::RecipeFragment;
use crate::registry::{MachineId, MachineInfo};
use crate::transport::{SshEndpoint, Transport};

mod server;

pub use server::{DEFAULT_SERVER_PORT, DEFAULT_STARTUP_GRACE, LocalServer, ServerError, ServerSettings};

/// Future returned by [`ProvisioningBackend`] methods.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Resources held while a backend is in use.
#[derive(Debug, Default)]
pub struct BackendSession {
    server: Option<LocalServer>,
}

impl BackendSession {
    /// Session with no background resources.
    #[must_use]
    pub const fn new() -> Self {
        Self { server: None }
    }

    /// Session owning a running local server.
    #[must_use]
    pub const fn with_server(server: LocalServer) -> Self {
        Self {
            server: Some(server),
        }
    }

    /// URL of the local server, when one is running.
    #[must_use]
    pub fn server_url(&self) -> Option<String> {
        self.server.as_ref().map(|server| server.url().to_owned())
    }

    /// Whether the session owns a local server.
    #[must_use]
    pub const fn has_server(&self) -> bool {
        self.server.is_some()
    }

    /// Stops owned resources.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when the local server cannot be stopped.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        match self.server {
            Some(server) => server.stop().await,
            None => Ok(()),
        }
    }
}

/// Service that provisions, reaches, and removes machines.
pub trait ProvisioningBackend: Send + Sync {
    /// Backend specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Connects to the backend, starting any local services it needs.
    fn connect(&self) -> BackendFuture<'_, BackendSession, Self::Error>;

    /// Releases a session obtained from [`Self::connect`].
    fn release(&self, session: BackendSession) -> BackendFuture<'_, (), Self::Error>;

    /// Destroys one machine.
    fn destroy_machine<'a>(
        &'a self,
        session: &'a BackendSession,
        machine: &'a MachineId,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Builds a transport for running commands on `machine`.
    ///
    /// `info` carries the addressing details recorded during converge.
    fn transport<'a>(
        &'a self,
        session: &'a BackendSession,
        machine: &'a MachineId,
        info: Option<&'a MachineInfo>,
    ) -> BackendFuture<'a, Box<dyn Transport>, Self::Error>;

    /// Direct-SSH details to persist in state, for backends that have them.
    fn connection_details<'a>(
        &'a self,
        session: &'a BackendSession,
        machine: &'a MachineId,
    ) -> BackendFuture<'a, Option<SshEndpoint>, Self::Error>;

    /// Layout fragment generated by the backend for when the operator
    /// configured none.
    fn layout_fragment(&self, action: ConvergeAction) -> Option<RecipeFragment>;
}
