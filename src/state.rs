//! Run state persisted for a later cleanup invocation.
//!
//! A checkout that configures credentials records where they went, so
//! `ghco cleanup` can reverse them from a separate process even if the
//! checkout process is long gone.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default state file location, relative to the current directory.
pub const DEFAULT_STATE_FILE: &str = ".ghco-state.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("state file at {0} is not valid: {1}")]
    Format(PathBuf, #[source] serde_json::Error),
}

/// What a cleanup run needs to know about a finished checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Where the working copy was placed.
    pub repository_path: PathBuf,
    /// Server the credentials were configured for.
    pub server_url: String,
    /// Temp file holding the SSH key, when SSH auth was used.
    pub ssh_key_path: Option<PathBuf>,
    /// Temp file holding the assembled known hosts.
    pub ssh_known_hosts_path: Option<PathBuf>,
}

impl RunState {
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let encoded = serde_json::to_string_pretty(self)
            .map_err(|e| StateError::Format(path.to_path_buf(), e))?;
        fs::write(path, encoded).map_err(|e| StateError::Io(path.to_path_buf(), e))
    }

    pub fn load(path: &Path) -> Result<RunState, StateError> {
        let content =
            fs::read_to_string(path).map_err(|e| StateError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| StateError::Format(path.to_path_buf(), e))
    }

    /// Delete the state file. Missing files are fine: cleanup may run
    /// twice, or after a checkout that never wrote state.
    pub fn remove(path: &Path) -> Result<(), StateError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Io(path.to_path_buf(), e)),
        }
    }
}
