//! GitHub REST API collaborator.
//!
//! Two jobs: resolving a repository's default branch when no ref or
//! commit was requested, and downloading a tarball of the repository
//! content when no usable git client is available. A failed call is
//! fatal to the acquisition; there is no retry layer.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;

use crate::types::RepoKey;

const USER_AGENT: &str = "ghco";

/// Counter for unique extraction staging directory names.
static EXTRACT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors returned by API operations.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The API answered with a non-success status.
    #[error("GitHub API returned HTTP {code} for {context}")]
    Status { code: u16, context: String },
    /// The request never completed.
    #[error("network error talking to GitHub: {0}")]
    Transport(String),
    /// The response body was not what we expected.
    #[error("failed to decode GitHub API response: {0}")]
    Decode(String),
    /// The downloaded archive could not be unpacked.
    #[error("archive extraction failed: {0}")]
    Extract(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    default_branch: String,
}

/// Client for the GitHub REST API of one server instance.
pub struct GitHubApi {
    agent: ureq::Agent,
    api_base: String,
    token: String,
}

impl GitHubApi {
    /// Create a client for `server_url` (e.g. `https://github.com`),
    /// authenticating with `token` when it is non-empty.
    pub fn new(server_url: &str, token: &str) -> Self {
        let agent = ureq::builder()
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            agent,
            api_base: api_base(server_url),
            token: token.to_string(),
        }
    }

    /// The default branch of `repo`, as a fully qualified ref
    /// (e.g. `refs/heads/main`).
    pub fn default_branch(&self, repo: &RepoKey) -> Result<String, ApiError> {
        let url = format!("{}/repos/{}", self.api_base, repo);
        let response = self.get(&url, Some(Duration::from_secs(10)), "repository metadata")?;
        let parsed: RepositoryResponse = serde_json::from_reader(response.into_reader())
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        if parsed.default_branch.is_empty() {
            return Err(ApiError::Decode(
                "repository metadata has an empty default branch".to_string(),
            ));
        }
        Ok(qualify_branch(parsed.default_branch))
    }

    /// Download a gzipped tarball of `repo` at `ref_or_commit` and
    /// unpack its content directly into `dest`.
    ///
    /// GitHub wraps archive content in a single top-level folder; that
    /// wrapper is stripped so `dest` holds the repository files
    /// themselves.
    pub fn download_tarball(
        &self,
        repo: &RepoKey,
        ref_or_commit: &str,
        dest: &Path,
    ) -> Result<(), ApiError> {
        let url = tarball_url(&self.api_base, repo, ref_or_commit);
        log::info!("Downloading archive of {} ({})", repo, ref_or_commit);
        let response = self.get(&url, None, "repository archive")?;
        extract_tarball(response.into_reader(), dest)?;
        log::debug!("Archive of {} unpacked into {}", repo, dest.display());
        Ok(())
    }

    fn get(
        &self,
        url: &str,
        timeout: Option<Duration>,
        context: &str,
    ) -> Result<ureq::Response, ApiError> {
        let mut request = self
            .agent
            .get(url)
            .set("User-Agent", USER_AGENT)
            .set("Accept", "application/vnd.github+json");
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if !self.token.is_empty() {
            request = request.set("Authorization", &format!("token {}", self.token));
        }

        match request.call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, _)) => Err(ApiError::Status {
                code,
                context: context.to_string(),
            }),
            Err(ureq::Error::Transport(e)) => Err(ApiError::Transport(e.to_string())),
        }
    }
}

/// REST endpoint base for a server URL. github.com uses its dedicated
/// API host; GitHub Enterprise serves the API under `/api/v3`.
fn api_base(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if trimmed == "https://github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("{}/api/v3", trimmed)
    }
}

fn qualify_branch(branch: String) -> String {
    if branch.starts_with("refs/") {
        branch
    } else {
        format!("refs/heads/{}", branch)
    }
}

fn tarball_url(api_base: &str, repo: &RepoKey, ref_or_commit: &str) -> String {
    if ref_or_commit.is_empty() {
        format!("{}/repos/{}/tarball", api_base, repo)
    } else {
        format!("{}/repos/{}/tarball/{}", api_base, repo, ref_or_commit)
    }
}

/// Unpack a gzipped tarball into `dest` via a staging directory next to
/// it, so partially extracted content never lands in the destination.
fn extract_tarball<R: Read>(reader: R, dest: &Path) -> Result<(), ApiError> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ApiError::Extract("destination has no parent directory".to_string()))?;
    let staging = parent.join(format!(
        ".ghco-extract-{}-{}",
        process::id(),
        EXTRACT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = unpack_and_move(reader, &staging, dest);
    if staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    result
}

fn unpack_and_move<R: Read>(reader: R, staging: &Path, dest: &Path) -> Result<(), ApiError> {
    let decoder = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive
        .unpack(staging)
        .map_err(|e| ApiError::Extract(format!("failed to unpack archive: {e}")))?;

    let mut entries: Vec<PathBuf> = fs::read_dir(staging)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;

    // A single top-level directory is the GitHub wrapper folder.
    let root = if entries.len() == 1 && entries[0].is_dir() {
        entries.remove(0)
    } else {
        staging.to_path_buf()
    };

    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        fs::rename(entry.path(), dest.join(entry.file_name()))?;
    }
    Ok(())
}
