//! Metal backend: machines provisioned and removed through the converge
//! engine, optionally backed by a local metadata server.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{
    BackendFuture, BackendSession, LocalServer, ProvisioningBackend, ServerError, ServerSettings,
};
use crate::command::CommandRunner;
use crate::engine::{ConvergeAction, ConvergeContext, ConvergeEngine, ConvergeFailure};
use crate::recipe::{FragmentOrigin, RecipeFragment, RecipeSet};
use crate::registry::{MachineId, MachineInfo};
use crate::transport::{SshEndpoint, SshTransport, Transport};
use crate::vagrant::ruby_string;

/// Errors raised by the metal backend.
#[derive(Debug, Error)]
pub enum MetalError {
    /// Raised when the local server cannot be started or stopped.
    #[error(transparent)]
    Server(#[from] ServerError),
    /// Raised when the delete recipe for a machine fails.
    #[error("failed to delete machine {machine}: {source}")]
    Destroy {
        /// Machine being deleted.
        machine: String,
        /// Engine failure.
        #[source]
        source: ConvergeFailure,
    },
}

/// Recipe deleting the machine named `machine`.
#[must_use]
pub fn delete_recipe(machine: &MachineId) -> RecipeSet {
    RecipeSet::new(
        None,
        RecipeFragment::generated(
            FragmentOrigin::Platform,
            format!(
                "machine {} do\n  action :delete\nend\n",
                ruby_string(machine.as_str())
            ),
        ),
    )
}

/// Metal provisioning backend.
#[derive(Clone, Debug)]
pub struct MetalBackend<E, R> {
    engine: E,
    runner: R,
    server: Option<ServerSettings>,
    ssh_user: String,
    ssh_key: Option<String>,
    timeout: Duration,
}

impl<E, R> MetalBackend<E, R>
where
    E: ConvergeEngine,
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    /// Creates a backend deleting machines through `engine` and reaching
    /// them over SSH through `runner`.
    #[must_use]
    pub fn new(engine: E, runner: R, ssh_user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            engine,
            runner,
            server: None,
            ssh_user: ssh_user.into(),
            ssh_key: None,
            timeout,
        }
    }

    /// Starts a local metadata server for each session.
    #[must_use]
    pub fn with_server(mut self, settings: ServerSettings) -> Self {
        self.server = Some(settings);
        self
    }

    /// Authenticates SSH with `key`.
    #[must_use]
    pub fn with_ssh_key(mut self, key: Option<String>) -> Self {
        self.ssh_key = key;
        self
    }
}

impl<E, R> ProvisioningBackend for MetalBackend<E, R>
where
    E: ConvergeEngine,
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    type Error = MetalError;

    fn name(&self) -> &'static str {
        "metal"
    }

    fn connect(&self) -> BackendFuture<'_, BackendSession, Self::Error> {
        Box::pin(async move {
            match &self.server {
                Some(settings) => {
                    let server = LocalServer::start(settings).await?;
                    Ok(BackendSession::with_server(server))
                }
                None => Ok(BackendSession::new()),
            }
        })
    }

    fn release(&self, session: BackendSession) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move { session.shutdown().await.map_err(MetalError::from) })
    }

    fn destroy_machine<'a>(
        &'a self,
        session: &'a BackendSession,
        machine: &'a MachineId,
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let recipes = delete_recipe(machine);
            let context = ConvergeContext {
                server_url: session.server_url(),
                cancel: cancel.clone(),
            };
            info!(%machine, "deleting machine");
            self.engine
                .apply(&recipes, ConvergeAction::Destroy, &context)
                .await
                .map_err(|source| MetalError::Destroy {
                    machine: machine.to_string(),
                    source,
                })?;
            Ok(())
        })
    }

    fn transport<'a>(
        &'a self,
        _session: &'a BackendSession,
        machine: &'a MachineId,
        info: Option<&'a MachineInfo>,
    ) -> BackendFuture<'a, Box<dyn Transport>, Self::Error> {
        Box::pin(async move {
            let address = info.map_or_else(|| machine.as_str(), MachineInfo::address);
            debug!(%machine, %address, "reaching machine over ssh");
            let endpoint = SshEndpoint {
                ssh_key: self.ssh_key.clone(),
                ..SshEndpoint::new(address)
            };
            let transport: Box<dyn Transport> = Box::new(SshTransport::new(
                self.runner.clone(),
                endpoint,
                self.ssh_user.clone(),
                self.timeout,
            ));
            Ok(transport)
        })
    }

    fn connection_details<'a>(
        &'a self,
        _session: &'a BackendSession,
        _machine: &'a MachineId,
    ) -> BackendFuture<'a, Option<SshEndpoint>, Self::Error> {
        Box::pin(async { Ok(None) })
    }

    fn layout_fragment(&self, _action: ConvergeAction) -> Option<RecipeFragment> {
        None
    }
}
