//! Source acquisition: the checkout orchestrator and its collaborators.
//!
//! The driver sequences one acquisition; the other modules are its
//! stateless collaborators (directory preparation, credential
//! lifecycle, ref resolution, fetch strategy, submodule handling).

pub mod auth;
pub mod driver;
pub mod fetch;
pub mod lock;
pub mod refs;
pub mod submodules;
pub mod workspace;

pub use driver::{AcquisitionMethod, CheckoutOutcome};

use thiserror::Error;

use crate::api::ApiError;
use crate::git::GitError;
use crate::state::StateError;

/// Errors surfaced by an acquisition.
#[derive(Error, Debug)]
pub enum CheckoutError {
    /// The requested settings cannot work with the chosen acquisition
    /// method. Raised before any network activity.
    #[error("configuration conflict: {0}")]
    Conflict(String),
    /// A native client was required but is unavailable or too old.
    #[error("capability error: {0}")]
    Capability(String),
    /// An unqualified ref matched neither a remote branch nor a tag.
    #[error("a branch or tag named '{0}' could not be found")]
    BranchNotFound(String),
    /// The checked-out commit is not the one that was requested.
    #[error(
        "checked-out commit does not match the requested target: expected {expected}, actual {actual}"
    )]
    Verification { expected: String, actual: String },
    /// Credential configuration could not be installed or substituted.
    #[error("credential configuration failed: {0}")]
    Auth(String),
    /// Git client failure.
    #[error(transparent)]
    Git(#[from] GitError),
    /// GitHub API failure.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The post-run state file could not be written.
    #[error(transparent)]
    State(#[from] StateError),
    /// The target directory lock could not be acquired.
    #[error("failed to lock the target directory: {0}")]
    Lock(#[source] std::io::Error),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
