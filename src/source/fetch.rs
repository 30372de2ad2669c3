//! Fetch planning and execution.
//!
//! Full-history checkouts fetch every branch and tag, then verify the
//! requested ref still resolves from what arrived. Between the fetch
//! and the verification the remote may have moved (push or force
//! push), so a failed verification triggers exactly one corrective
//! fetch with a targeted refspec before giving up on resolution.

use log::info;

use crate::git::{FetchOptions, GitCli};
use crate::source::refs;
use crate::source::CheckoutError;

/// How the fetch phase will talk to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    /// Unlimited depth: all branches and tags, corrective re-fetch if
    /// the requested ref moved.
    FullHistory { refspecs: Vec<String> },
    /// Shallow targeted fetch of just the requested ref.
    Targeted { refspecs: Vec<String>, depth: u32 },
}

/// Decide the fetch strategy for a ref/commit at a given depth.
pub fn plan(ref_: Option<&str>, commit: Option<&str>, fetch_depth: u32) -> FetchPlan {
    if fetch_depth == 0 {
        FetchPlan::FullHistory {
            refspecs: refs::refspec_for_all_history(ref_, commit),
        }
    } else {
        FetchPlan::Targeted {
            refspecs: refs::refspec(ref_, commit),
            depth: fetch_depth,
        }
    }
}

/// Fetch the requested ref/commit into the repository at `git`.
pub fn fetch_repository(
    git: &GitCli,
    ref_: Option<&str>,
    commit: Option<&str>,
    fetch_depth: u32,
) -> Result<(), CheckoutError> {
    match plan(ref_, commit, fetch_depth) {
        FetchPlan::FullHistory { refspecs } => {
            git.fetch(&refspecs, &FetchOptions { depth: None })?;
            if !refs::test_ref(git, ref_, commit)? {
                info!("fetched history does not contain the requested ref, fetching it directly");
                let refspecs = refs::refspec(ref_, commit);
                git.fetch(&refspecs, &FetchOptions { depth: None })?;
            }
        }
        FetchPlan::Targeted { refspecs, depth } => {
            git.fetch(&refspecs, &FetchOptions { depth: Some(depth) })?;
        }
    }
    Ok(())
}
