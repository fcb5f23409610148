//! JSON persistence for [`InstanceState`] between process invocations.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use super::InstanceState;

/// Errors raised while loading or saving instance state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the state file is not valid JSON for [`InstanceState`].
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the configured path has no file name.
    #[error("state path {path} is missing a file name")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// Reads and writes instance state as a JSON document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateStore {
    path: Utf8PathBuf,
}

impl StateStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional location of an instance's state under the kitchen root.
    #[must_use]
    pub fn for_instance(kitchen_root: &Utf8Path, instance_name: &str) -> Self {
        Self::new(
            kitchen_root
                .join(".kitchen")
                .join(format!("{instance_name}.json")),
        )
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads state, returning the default when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the file cannot be read or parsed.
    pub fn load(&self) -> Result<InstanceState, StateStoreError> {
        let file_name = self.file_name()?;
        let parent = parent_dir(&self.path);
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(InstanceState::default());
            }
            Err(err) => return Err(io_error(parent, &err)),
        };

        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(InstanceState::default());
            }
            Err(err) => return Err(io_error(&self.path, &err)),
        };
        if contents.trim().is_empty() {
            return Ok(InstanceState::default());
        }

        serde_json::from_str(&contents).map_err(|err| StateStoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    /// Writes state, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the directory or file cannot be
    /// written.
    pub fn save(&self, state: &InstanceState) -> Result<(), StateStoreError> {
        let file_name = self.file_name()?;
        let parent = parent_dir(&self.path);
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;

        let mut rendered =
            serde_json::to_string_pretty(state).map_err(|err| StateStoreError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        rendered.push('\n');
        dir.write(file_name, rendered)
            .map_err(|err| io_error(&self.path, &err))
    }

    fn file_name(&self) -> Result<&str, StateStoreError> {
        self.path
            .file_name()
            .ok_or_else(|| StateStoreError::MissingFileName {
                path: self.path.clone(),
            })
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StateStoreError {
    StateStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn parent_dir(path: &Utf8Path) -> &Utf8Path {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."))
}
