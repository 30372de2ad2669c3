//! Submodule handling after the top-level checkout.
//!
//! Submodule clones are nested repositories that never see the
//! parent's local credential configuration, so the whole phase runs
//! inside a temporary global credential scope that is reversed on
//! every exit path.

use log::{info, warn};

use crate::git::{FetchOptions, GitCli};
use crate::settings::CheckoutSettings;
use crate::source::auth::AuthConfig;
use crate::source::refs;
use crate::source::CheckoutError;

/// Bring submodules up to date for a checked-out working copy.
pub fn checkout_submodules(
    git: &mut GitCli,
    auth: &mut AuthConfig,
    settings: &CheckoutSettings,
) -> Result<(), CheckoutError> {
    info!("setting up auth for fetching submodules");
    auth.configure_global(git)?;
    let result = submodule_phase(git, auth, settings);
    auth.remove_global(git);
    result
}

fn submodule_phase(
    git: &GitCli,
    auth: &AuthConfig,
    settings: &CheckoutSettings,
) -> Result<(), CheckoutError> {
    update_submodules(git, settings)?;

    if let Some(branch) = &settings.submodules_remote_branch {
        override_submodule_branches(git, settings, branch)?;
    }

    if settings.persist_credentials {
        info!("persisting credentials for submodules");
        auth.configure_submodules(git)?;
    }
    Ok(())
}

fn update_submodules(git: &GitCli, settings: &CheckoutSettings) -> Result<(), CheckoutError> {
    info!("fetching submodules");
    let recursive = settings.submodules.recursive();
    let depth = (settings.fetch_depth > 0).then_some(settings.fetch_depth);
    git.submodule_sync(recursive)?;
    git.submodule_update(recursive, depth)?;
    if let Err(e) = git.submodule_foreach(recursive, "git config --local gc.auto 0") {
        warn!("failed to disable automatic garbage collection in submodules: {e}");
    }
    Ok(())
}

/// Switch each submodule that exposes `branch` on its own remote over
/// to that branch; the rest stay at the parent-pinned revision. Any
/// per-submodule failure skips that submodule rather than aborting.
fn override_submodule_branches(
    parent: &GitCli,
    settings: &CheckoutSettings,
    branch: &str,
) -> Result<(), CheckoutError> {
    let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
    let qualified = format!("refs/heads/{short}");
    for path in parent.submodule_paths()? {
        if let Err(e) = override_one(parent, settings, &qualified, short, &path) {
            warn!("skipping remote-branch override for submodule '{path}': {e}");
        }
    }
    Ok(())
}

fn override_one(
    parent: &GitCli,
    settings: &CheckoutSettings,
    qualified: &str,
    short: &str,
    path: &str,
) -> Result<(), CheckoutError> {
    let submodule_dir = parent.work_dir().join(path);
    let mut sub = GitCli::open(&submodule_dir, settings.lfs)?;
    for key in ["GIT_SSH_COMMAND", "HOME"] {
        if let Some(value) = parent.env(key) {
            sub.set_env(key, value);
        }
    }

    if !sub.remote_branch_exists(short)? {
        info!("submodule '{path}' has no branch named '{short}', leaving the pinned revision");
        return Ok(());
    }

    if settings.lfs {
        sub.lfs_install()?;
    }
    // A full-history update already brought everything in; only a
    // shallow update needs the override branch fetched explicitly.
    if settings.fetch_depth > 0 {
        let refspecs = refs::refspec(Some(qualified), None);
        sub.fetch(
            &refspecs,
            &FetchOptions {
                depth: Some(settings.fetch_depth),
            },
        )?;
    }
    let checkout = refs::checkout_info(&sub, Some(qualified), None)?;
    sub.checkout(&checkout.ref_, checkout.start_point.as_deref())?;
    info!("submodule '{path}' switched to branch '{short}'");
    Ok(())
}
