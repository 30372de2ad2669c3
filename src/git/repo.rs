//! Local read operations through libgit2.
//!
//! Nothing here touches the network; these calls answer "is this
//! directory a repository we can reuse" without spawning a process.

use git2::Repository;
use std::path::Path;

use crate::git::GitError;

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Check if a path contains a valid git repository.
pub fn repository_exists(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

/// The fetch URL of the `origin` remote, if the repository has one.
pub fn remote_fetch_url(path: &Path) -> Result<Option<String>, GitError> {
    let repo = open_repository(path)?;
    match repo.find_remote("origin") {
        Ok(remote) => Ok(remote.url().map(String::from)),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(GitError::Git(e)),
    }
}
