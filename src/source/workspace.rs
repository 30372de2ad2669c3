//! Working directory preparation.
//!
//! A conflicting non-directory path is removed outright. An existing
//! directory is reused only when it already holds a repository whose
//! fetch URL matches the requested one and its leftover state can be
//! cleared; anything else gets its contents wiped so acquisition
//! starts from an empty directory. The directory itself survives, it
//! may be the caller's working directory.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::git::{repo, GitCli, GitError};
use crate::source::CheckoutError;

/// Remove a conflicting non-directory path and create the directory if
/// missing. Returns whether the directory already existed.
pub fn ensure_directory(path: &Path) -> Result<bool, CheckoutError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(true),
        Ok(_) => {
            fs::remove_file(path)?;
            fs::create_dir_all(path)?;
            Ok(false)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(path)?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Decide whether an existing directory can host the acquisition as-is
/// and reset it accordingly. Falls back to wiping the contents when
/// the directory holds anything other than a reusable repository.
pub fn prepare_existing_directory(
    git: Option<&GitCli>,
    repository_path: &Path,
    repository_url: &str,
    clean: bool,
    ref_: Option<&str>,
) -> Result<(), CheckoutError> {
    let reusable = match git {
        Some(git) => try_reuse(git, repository_path, repository_url, clean, ref_),
        None => false,
    };
    if !reusable {
        info!("deleting the contents of '{}'", repository_path.display());
        remove_contents(repository_path)?;
    }
    Ok(())
}

fn try_reuse(
    git: &GitCli,
    repository_path: &Path,
    repository_url: &str,
    clean: bool,
    ref_: Option<&str>,
) -> bool {
    if !repository_path.join(".git").is_dir() {
        return false;
    }
    match repo::remote_fetch_url(repository_path) {
        Ok(Some(url)) if url == repository_url => {}
        Ok(_) => return false,
        Err(e) => {
            debug!("unable to read the existing fetch URL: {e}");
            return false;
        }
    }

    // Locks left behind by a previously canceled run.
    for lock_name in ["index.lock", "shallow.lock"] {
        let lock_path = repository_path.join(".git").join(lock_name);
        if let Err(e) = fs::remove_file(&lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("unable to delete '{}': {e}", lock_path.display());
            }
        }
    }

    if let Err(e) = remove_stale_refs(git, ref_) {
        warn!("unable to prepare the existing repository, recreating it: {e}");
        return false;
    }

    if clean {
        info!("cleaning the repository");
        if !git.try_clean() || !git.try_reset_hard() {
            warn!("unable to clean or reset the repository, recreating it");
            return false;
        }
    }
    true
}

/// Drop refs a previous run created so the upcoming fetch and
/// checkout cannot collide with them.
fn remove_stale_refs(git: &GitCli, ref_: Option<&str>) -> Result<(), GitError> {
    info!("removing previously created refs, to avoid conflicts");
    if !git.is_detached()? {
        git.checkout_detach()?;
    }
    for branch in git.branch_list(false)? {
        git.branch_delete(false, &branch)?;
    }
    if let Some(ref_) = ref_ {
        let remote_branches = git.branch_list(true)?;
        for branch in conflicting_remote_branches(ref_, &remote_branches) {
            git.branch_delete(true, &branch)?;
        }
    }
    Ok(())
}

/// Remote-tracking branches that collide with the requested branch
/// name on either side of a `/` boundary. A leftover `origin/foo/bar`
/// blocks fetching `refs/heads/foo`, and a leftover `origin/foo`
/// blocks fetching `refs/heads/foo/bar`.
fn conflicting_remote_branches(ref_: &str, branches: &[String]) -> Vec<String> {
    let qualified = if ref_.starts_with("refs/") {
        ref_.to_string()
    } else {
        format!("refs/heads/{ref_}")
    };
    let Some(name) = qualified.strip_prefix("refs/heads/") else {
        return Vec::new();
    };
    let requested = format!("ORIGIN/{}/", name.to_ascii_uppercase());
    branches
        .iter()
        .filter(|branch| {
            let existing = format!("{}/", branch.to_ascii_uppercase());
            requested.starts_with(&existing) || existing.starts_with(&requested)
        })
        .cloned()
        .collect()
}

fn remove_contents(dir: &Path) -> Result<(), CheckoutError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
