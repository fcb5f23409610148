//! Local metadata server owned by a backend session.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info};

/// Default port for the local metadata server.
pub const DEFAULT_SERVER_PORT: u16 = 8889;

/// Time the server is given to fail fast before it is considered up.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Errors raised while starting or stopping the local server.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServerError {
    /// Raised when the server binary cannot be spawned.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Server executable.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the server exits before it is usable.
    #[error("{program} exited during startup with status {status_text}")]
    ExitedEarly {
        /// Server executable.
        program: String,
        /// Exit status of the server.
        status_text: String,
    },
    /// Raised when the server cannot be stopped.
    #[error("failed to stop {program}: {message}")]
    Stop {
        /// Server executable.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// How to launch the local server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSettings {
    /// Server executable.
    pub server_bin: String,
    /// Arguments placed before `--port`.
    pub args: Vec<String>,
    /// Port the server listens on.
    pub port: u16,
    /// Time to wait for an early exit before declaring the server up.
    pub startup_grace: Duration,
}

impl ServerSettings {
    /// Settings for `server_bin` on `port` with no extra arguments.
    #[must_use]
    pub fn new(server_bin: impl Into<String>, port: u16) -> Self {
        Self {
            server_bin: server_bin.into(),
            args: Vec::new(),
            port,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// Running local server process.
///
/// The process is killed when the value is dropped; [`LocalServer::stop`]
/// stops it explicitly and reports failures.
#[derive(Debug)]
pub struct LocalServer {
    program: String,
    url: String,
    child: Child,
}

impl LocalServer {
    /// Launches the server and waits out the startup grace period.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when the process cannot be spawned or exits
    /// during the grace period.
    pub async fn start(settings: &ServerSettings) -> Result<Self, ServerError> {
        let program = settings.server_bin.clone();
        let mut child = Command::new(&settings.server_bin)
            .args(&settings.args)
            .arg("--port")
            .arg(settings.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ServerError::Spawn {
                program: program.clone(),
                message: err.to_string(),
            })?;

        sleep(settings.startup_grace).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ServerError::ExitedEarly {
                program,
                status_text: status
                    .code()
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            });
        }

        let url = format!("http://127.0.0.1:{}", settings.port);
        info!(server = %program, %url, pid = child.id(), "local server started");
        Ok(Self {
            program,
            url,
            child,
        })
    }

    /// URL clients use to reach the server.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Process identifier, while the process is running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stops the server and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stop`] when the process cannot be killed.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        debug!(server = %self.program, "stopping local server");
        self.child.kill().await.map_err(|err| ServerError::Stop {
            program: self.program.clone(),
            message: err.to_string(),
        })
    }
}
