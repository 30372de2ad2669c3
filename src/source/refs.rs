//! Ref resolution: turning a requested ref/commit pair into refspecs to
//! fetch and a concrete target to check out.
//!
//! Qualified refs (`refs/heads/...`, `refs/tags/...`, `refs/pull/...`)
//! resolve without touching the repository. Unqualified names are
//! disambiguated against what the fetch actually brought in: a remote
//! branch wins over a tag of the same name, and a name matching neither
//! is an error rather than a silent fallback to the default branch.

use crate::api::GitHubApi;
use crate::git::{CommitInfo, GitCli, GitError, TAGS_REFSPEC};
use crate::settings::CheckoutSettings;
use crate::source::CheckoutError;

/// What to pass to checkout once fetching is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutInfo {
    /// Ref or commit to check out.
    pub ref_: String,
    /// Start point for branch (re)creation, when the ref alone would be
    /// ambiguous between local and remote namespaces.
    pub start_point: Option<String>,
}

fn strip_prefix_ignore_ascii_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// Whether `ref_` names a pull request test-merge ref
/// (`refs/pull/<number>/merge`).
pub fn is_pull_merge_ref(ref_: &str) -> bool {
    strip_prefix_ignore_ascii_case(ref_, "refs/pull/")
        .and_then(|rest| rest.strip_suffix("/merge"))
        .map(|number| !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Resolution for refs that need no repository state. Returns `None`
/// for unqualified names, which must be disambiguated via the client.
fn qualified_checkout_info(ref_: &str, commit: Option<&str>) -> Option<CheckoutInfo> {
    if ref_.is_empty() {
        let commit = commit.filter(|c| !c.is_empty())?;
        return Some(CheckoutInfo {
            ref_: commit.to_string(),
            start_point: None,
        });
    }
    if let Some(branch) = strip_prefix_ignore_ascii_case(ref_, "refs/heads/") {
        return Some(CheckoutInfo {
            ref_: branch.to_string(),
            start_point: Some(format!("refs/remotes/origin/{branch}")),
        });
    }
    if let Some(rest) = strip_prefix_ignore_ascii_case(ref_, "refs/pull/") {
        return Some(CheckoutInfo {
            ref_: format!("refs/remotes/pull/{rest}"),
            start_point: None,
        });
    }
    if strip_prefix_ignore_ascii_case(ref_, "refs/").is_some() {
        return Some(CheckoutInfo {
            ref_: ref_.to_string(),
            start_point: None,
        });
    }
    None
}

/// Resolve what to check out for the requested ref/commit.
pub fn checkout_info(
    git: &GitCli,
    ref_: Option<&str>,
    commit: Option<&str>,
) -> Result<CheckoutInfo, CheckoutError> {
    let ref_ = ref_.unwrap_or("");
    if ref_.is_empty() && commit.map_or(true, str::is_empty) {
        return Err(CheckoutError::Conflict(
            "a ref or a commit is required to resolve a checkout target".to_string(),
        ));
    }

    if let Some(info) = qualified_checkout_info(ref_, commit) {
        return Ok(info);
    }

    // Unqualified: a remote branch wins over a tag of the same name.
    if git.branch_exists(true, &format!("origin/{ref_}"))? {
        return Ok(CheckoutInfo {
            ref_: ref_.to_string(),
            start_point: Some(format!("refs/remotes/origin/{ref_}")),
        });
    }
    if git.tag_exists(ref_)? {
        return Ok(CheckoutInfo {
            ref_: format!("refs/tags/{ref_}"),
            start_point: None,
        });
    }

    Err(CheckoutError::BranchNotFound(ref_.to_string()))
}

/// Refspecs for a full-history fetch: every branch and tag, plus the
/// pull ref itself when one was requested (pull refs live outside the
/// branch namespace and would otherwise not be fetched).
pub fn refspec_for_all_history(ref_: Option<&str>, commit: Option<&str>) -> Vec<String> {
    let mut result = vec![
        "+refs/heads/*:refs/remotes/origin/*".to_string(),
        TAGS_REFSPEC.to_string(),
    ];
    if let Some(ref_) = ref_ {
        if let Some(rest) = strip_prefix_ignore_ascii_case(ref_, "refs/pull/") {
            let source = commit.filter(|c| !c.is_empty()).unwrap_or(ref_);
            result.push(format!("+{source}:refs/remotes/pull/{rest}"));
        }
    }
    result
}

/// The targeted refspec set for one ref/commit.
///
/// With a commit, the commit itself is fetched and mapped onto the
/// ref's tracking name so later resolution sees consistent state. An
/// unqualified name fetches both branch and tag candidates (including
/// prefix matches, so the existence checks afterwards can tell which
/// one it was).
pub fn refspec(ref_: Option<&str>, commit: Option<&str>) -> Vec<String> {
    let ref_ = ref_.unwrap_or("");

    if let Some(commit) = commit.filter(|c| !c.is_empty()) {
        if let Some(branch) = strip_prefix_ignore_ascii_case(ref_, "refs/heads/") {
            return vec![format!("+{commit}:refs/remotes/origin/{branch}")];
        }
        if let Some(rest) = strip_prefix_ignore_ascii_case(ref_, "refs/pull/") {
            return vec![format!("+{commit}:refs/remotes/pull/{rest}")];
        }
        if strip_prefix_ignore_ascii_case(ref_, "refs/tags/").is_some() {
            return vec![format!("+{commit}:{ref_}")];
        }
        return vec![commit.to_string()];
    }

    if let Some(branch) = strip_prefix_ignore_ascii_case(ref_, "refs/heads/") {
        return vec![format!("+{ref_}:refs/remotes/origin/{branch}")];
    }
    if let Some(rest) = strip_prefix_ignore_ascii_case(ref_, "refs/pull/") {
        return vec![format!("+{ref_}:refs/remotes/pull/{rest}")];
    }
    if strip_prefix_ignore_ascii_case(ref_, "refs/tags/").is_some() {
        return vec![format!("+{ref_}:{ref_}")];
    }
    if strip_prefix_ignore_ascii_case(ref_, "refs/").is_some() {
        return vec![format!("+{ref_}:{ref_}")];
    }
    vec![
        format!("+refs/heads/{ref_}*:refs/remotes/origin/{ref_}*"),
        format!("+refs/tags/{ref_}*:refs/tags/{ref_}*"),
    ]
}

/// Whether the local repository state still satisfies the requested
/// ref/commit after a fetch. A `false` answer means the remote moved
/// between fetch and resolution and a corrective fetch is needed.
pub fn test_ref(git: &GitCli, ref_: Option<&str>, commit: Option<&str>) -> Result<bool, GitError> {
    let ref_ = ref_.unwrap_or("");
    let commit = commit.unwrap_or("");

    if commit.is_empty() {
        if ref_.is_empty() {
            return Ok(false);
        }
        if let Some(branch) = strip_prefix_ignore_ascii_case(ref_, "refs/heads/") {
            return git.branch_exists(true, &format!("origin/{branch}"));
        }
        if strip_prefix_ignore_ascii_case(ref_, "refs/pull/").is_some() {
            // Pull refs are fetched directly into place.
            return Ok(true);
        }
        if let Some(tag) = strip_prefix_ignore_ascii_case(ref_, "refs/tags/") {
            return git.tag_exists(tag);
        }
        if strip_prefix_ignore_ascii_case(ref_, "refs/").is_some() {
            return git.sha_exists(ref_);
        }
        // Unqualified
        return Ok(git.branch_exists(true, &format!("origin/{ref_}"))? || git.tag_exists(ref_)?);
    }

    if !git.sha_exists(commit)? {
        return Ok(false);
    }
    if ref_.is_empty() {
        return Ok(true);
    }
    if let Some(branch) = strip_prefix_ignore_ascii_case(ref_, "refs/heads/") {
        return Ok(git.branch_exists(true, &format!("origin/{branch}"))?
            && rev_matches(git, &format!("refs/remotes/origin/{branch}"), commit)?);
    }
    if strip_prefix_ignore_ascii_case(ref_, "refs/pull/").is_some() {
        // Fetched by commit, so the content is what was asked for.
        return Ok(true);
    }
    if let Some(tag) = strip_prefix_ignore_ascii_case(ref_, "refs/tags/") {
        return Ok(git.tag_exists(tag)? && rev_matches(git, ref_, commit)?);
    }
    if strip_prefix_ignore_ascii_case(ref_, "refs/").is_some() {
        return rev_matches(git, ref_, commit);
    }
    // Unqualified
    let branch_matches = git.branch_exists(true, &format!("origin/{ref_}"))?
        && rev_matches(git, &format!("refs/remotes/origin/{ref_}"), commit)?;
    if branch_matches {
        return Ok(true);
    }
    Ok(git.tag_exists(ref_)? && rev_matches(git, &format!("refs/tags/{ref_}"), commit)?)
}

fn rev_matches(git: &GitCli, rev: &str, commit: &str) -> Result<bool, GitError> {
    match git.rev_parse(rev) {
        Ok(sha) => Ok(sha == commit),
        Err(GitError::Command { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Determine the remote's default branch, fully qualified.
///
/// SSH checkouts may have no usable API token, so the branch is read
/// over the git transport instead.
pub fn default_branch(
    git: &GitCli,
    api: &GitHubApi,
    settings: &CheckoutSettings,
) -> Result<String, CheckoutError> {
    if settings.ssh_key.is_some() {
        Ok(git.get_default_branch(&settings.repository_url())?)
    } else {
        Ok(api.default_branch(&settings.repository)?)
    }
}

/// Post-checkout verification for pull request test-merge refs.
///
/// A regenerated test merge means the checked-out merge commit is no
/// longer the requested one; in that case neither the commit itself nor
/// its merged-in head parent matches what was asked for, and using the
/// content silently would run the wrong code.
pub fn validate_commit_info(
    info: &CommitInfo,
    ref_: Option<&str>,
    expected_commit: Option<&str>,
) -> Result<(), CheckoutError> {
    let ref_ = ref_.unwrap_or("");
    let expected = match expected_commit.filter(|c| !c.is_empty()) {
        Some(expected) => expected,
        None => return Ok(()),
    };
    if !is_pull_merge_ref(ref_) {
        return Ok(());
    }
    if info.sha == expected {
        return Ok(());
    }
    if info.parents.last().map(String::as_str) == Some(expected) {
        return Ok(());
    }
    Err(CheckoutError::Verification {
        expected: expected.to_string(),
        actual: info.sha.clone(),
    })
}
