//! Git client layer using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for network and mutating operations:**
//! - fetch, checkout, submodule update, LFS, config writes
//! - anything where the system git's wire protocol support matters
//!
//! **libgit2 for local read operations:**
//! - `open_repository` / `repository_exists` - path validation
//! - `remote_fetch_url` - deciding whether an existing directory can be
//!   reused for the same remote

pub mod cli;
pub mod repo;
pub mod version;

pub use cli::{CommitInfo, ConfigScope, FetchOptions, GitCli};
pub use version::GitVersion;

use thiserror::Error;

/// Refspec that mirrors every tag; fetches carrying it skip `--no-tags`.
pub const TAGS_REFSPEC: &str = "+refs/tags/*:refs/tags/*";

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// The git binary is missing or too old for what was asked of it.
    #[error("git is not usable: {0}")]
    Capability(String),
    /// A spawned git command exited non-zero.
    #[error("git {action} failed: {stderr}")]
    Command { action: String, stderr: String },
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git output: {0}")]
    Parse(String),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate that a git ref (branch, tag, or commit SHA) does not contain
/// dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub(crate) fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate an assembled refspec.
///
/// Same rules as [`validate_git_ref`] except a single leading `+`
/// (force-update marker) is allowed.
pub(crate) fn validate_refspec(value: &str) -> Result<(), GitError> {
    let inner = value.strip_prefix('+').unwrap_or(value);
    if inner.starts_with('+') {
        return Err(GitError::InvalidInput(
            "refspec cannot contain repeated '+'".to_string(),
        ));
    }
    validate_git_ref(inner, "refspec")
}
