//! The acquisition driver: one call from settings to a populated
//! working directory.
//!
//! The directory is prepared first, then a native client is resolved.
//! Without one the repository is downloaded as an archive; with one
//! the driver runs init, auth, fetch, checkout, submodules and
//! verification, with credential teardown guaranteed on every exit
//! path.

use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use log::{info, warn};

use crate::api::GitHubApi;
use crate::git::version::MINIMUM_GIT_SPARSE_CHECKOUT_VERSION;
use crate::git::{repo, ConfigScope, GitCli};
use crate::settings::CheckoutSettings;
use crate::source::auth::{self, AuthConfig};
use crate::source::lock::CheckoutLock;
use crate::source::{fetch, refs, submodules, workspace, CheckoutError};
use crate::state::{RunState, StateError};

/// Which path produced the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMethod {
    /// Native client: a full repository with version-control metadata.
    Git,
    /// REST archive download: file content only.
    Archive,
}

impl fmt::Display for AcquisitionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionMethod::Git => write!(f, "git"),
            AcquisitionMethod::Archive => write!(f, "archive"),
        }
    }
}

/// What an acquisition produced.
#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub method: AcquisitionMethod,
    pub repository_path: PathBuf,
    /// Ref that drove the checkout, after default-branch resolution.
    pub ref_: Option<String>,
    /// Commit that ended up checked out, when metadata exists to say.
    pub commit: Option<String>,
}

/// Acquire the repository described by `settings`.
pub fn acquire(settings: &CheckoutSettings) -> Result<CheckoutOutcome, CheckoutError> {
    info!("syncing repository {}", settings.repository);
    let repository_url = settings.repository_url();

    let _lock =
        CheckoutLock::acquire_for(&settings.repository_path).map_err(CheckoutError::Lock)?;
    let existing = workspace::ensure_directory(&settings.repository_path)?;

    info!("getting git version info");
    let client = resolve_client(settings)?;
    initial_state(settings).save(&settings.state_file)?;

    let api = GitHubApi::new(&settings.server_url, &settings.auth_token);
    match client {
        Some(mut git) => acquire_with_git(&mut git, &api, settings, &repository_url, existing),
        None => acquire_archive(&api, settings, &repository_url, existing),
    }
}

/// Reverse what a previous run recorded: credential configuration in
/// the repository, key material on disk, and the state file itself.
pub fn cleanup(state_file: &Path) -> Result<(), CheckoutError> {
    let state = match RunState::load(state_file) {
        Ok(state) => state,
        Err(StateError::Io(path, e)) if e.kind() == io::ErrorKind::NotFound => {
            info!("no run state at {}, nothing to clean up", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if repo::repository_exists(&state.repository_path) {
        match GitCli::open(&state.repository_path, false) {
            Ok(git) => auth::remove_recorded(&git, &state)?,
            Err(e) => {
                warn!("skipping credential removal, no usable git client: {e}");
                auth::remove_recorded_files(&state);
            }
        }
    } else {
        auth::remove_recorded_files(&state);
    }

    RunState::remove(state_file)?;
    Ok(())
}

/// Try to construct a native client. Failure falls back to the
/// archive path unless LFS was requested, which only the native
/// client can provide.
fn resolve_client(settings: &CheckoutSettings) -> Result<Option<GitCli>, CheckoutError> {
    resolve_client_with("git", settings)
}

fn resolve_client_with(
    git_path: &str,
    settings: &CheckoutSettings,
) -> Result<Option<GitCli>, CheckoutError> {
    match GitCli::with_git_path(git_path, &settings.repository_path, settings.lfs) {
        Ok(git) => {
            info!("using git {}", git.version());
            if let Some(lfs_version) = git.lfs_version() {
                info!("using git-lfs {lfs_version}");
            }
            if settings.sparse_checkout.is_some()
                && git.version() < MINIMUM_GIT_SPARSE_CHECKOUT_VERSION
            {
                return Err(CheckoutError::Capability(format!(
                    "sparse checkout requires git {MINIMUM_GIT_SPARSE_CHECKOUT_VERSION} or \
                     later, found {}",
                    git.version()
                )));
            }
            Ok(Some(git))
        }
        Err(e) if settings.lfs => Err(CheckoutError::Capability(format!(
            "an LFS checkout needs a working git client: {e}"
        ))),
        Err(e) => {
            info!("no usable git client, falling back to an archive download: {e}");
            Ok(None)
        }
    }
}

fn initial_state(settings: &CheckoutSettings) -> RunState {
    RunState {
        repository_path: settings.repository_path.clone(),
        server_url: settings.server_url.clone(),
        ssh_key_path: None,
        ssh_known_hosts_path: None,
    }
}

fn acquire_with_git(
    git: &mut GitCli,
    api: &GitHubApi,
    settings: &CheckoutSettings,
    repository_url: &str,
    existing: bool,
) -> Result<CheckoutOutcome, CheckoutError> {
    let mut auth = AuthConfig::new(settings);
    let result = git_acquisition(git, &mut auth, api, settings, repository_url, existing);
    auth.remove_global(git);
    result
}

fn git_acquisition(
    git: &mut GitCli,
    auth: &mut AuthConfig,
    api: &GitHubApi,
    settings: &CheckoutSettings,
    repository_url: &str,
    existing: bool,
) -> Result<CheckoutOutcome, CheckoutError> {
    if settings.set_safe_directory {
        info!("marking the repository directory as safe in the temporary global config");
        auth.configure_temp_global(git)?;
        git.config_add(
            ConfigScope::Global,
            "safe.directory",
            &settings.repository_path.display().to_string(),
        )?;
    }

    if existing {
        workspace::prepare_existing_directory(
            Some(git),
            &settings.repository_path,
            repository_url,
            settings.clean,
            settings.git_ref.as_deref(),
        )?;
    }

    if !settings.repository_path.join(".git").is_dir() {
        info!("initializing the repository");
        git.init()?;
        git.remote_add("origin", repository_url)?;
    }

    if !git.try_disable_automatic_gc() {
        warn!("unable to turn off automatic garbage collection, the fetch may be slowed by it");
    }

    auth::with_auth(auth, git, |git, auth| {
        let mut state = initial_state(settings);
        state.ssh_key_path = auth.ssh_key_path().map(Path::to_path_buf);
        state.ssh_known_hosts_path = auth.ssh_known_hosts_path().map(Path::to_path_buf);
        state.save(&settings.state_file)?;
        checkout_body(git, auth, api, settings)
    })
}

fn checkout_body(
    git: &mut GitCli,
    auth: &mut AuthConfig,
    api: &GitHubApi,
    settings: &CheckoutSettings,
) -> Result<CheckoutOutcome, CheckoutError> {
    let resolved_ref = resolve_ref(git, api, settings)?;
    let ref_ = resolved_ref.as_deref();
    let commit = settings.commit.as_deref();

    if settings.lfs {
        git.lfs_install()?;
    }

    info!("fetching the repository");
    fetch::fetch_repository(git, ref_, commit, settings.fetch_depth)?;

    info!("determining the checkout info");
    let checkout = refs::checkout_info(git, ref_, commit)?;

    if settings.lfs {
        info!("fetching LFS objects");
        git.lfs_fetch(checkout.start_point.as_deref().unwrap_or(&checkout.ref_))?;
    }

    if let Some(patterns) = &settings.sparse_checkout {
        info!("setting up sparse checkout");
        git.sparse_checkout(patterns)?;
    }

    info!("checking out the ref");
    git.checkout(&checkout.ref_, checkout.start_point.as_deref())?;

    if settings.submodules.enabled() {
        submodules::checkout_submodules(git, auth, settings)?;
    }

    let commit_info = git.commit_info()?;
    info!("checked out commit {}", commit_info.sha);
    refs::validate_commit_info(&commit_info, ref_, commit)?;

    Ok(CheckoutOutcome {
        method: AcquisitionMethod::Git,
        repository_path: settings.repository_path.clone(),
        ref_: resolved_ref,
        commit: Some(commit_info.sha),
    })
}

/// The ref driving fetch and checkout: the requested one, or the
/// remote's default branch when neither a ref nor a commit was given.
fn resolve_ref(
    git: &GitCli,
    api: &GitHubApi,
    settings: &CheckoutSettings,
) -> Result<Option<String>, CheckoutError> {
    let ref_given = settings.git_ref.as_deref().is_some_and(|r| !r.is_empty());
    let commit_given = settings.commit.as_deref().is_some_and(|c| !c.is_empty());
    if ref_given || commit_given {
        return Ok(settings.git_ref.clone());
    }
    info!("determining the default branch");
    Ok(Some(refs::default_branch(git, api, settings)?))
}

fn acquire_archive(
    api: &GitHubApi,
    settings: &CheckoutSettings,
    repository_url: &str,
    existing: bool,
) -> Result<CheckoutOutcome, CheckoutError> {
    if existing {
        workspace::prepare_existing_directory(
            None,
            &settings.repository_path,
            repository_url,
            settings.clean,
            settings.git_ref.as_deref(),
        )?;
    }
    info!("the repository will be downloaded as an archive");

    if settings.submodules.enabled() {
        return Err(CheckoutError::Conflict(
            "checking out submodules needs a native git client, which is unavailable; the \
             archive download cannot provide them"
                .to_string(),
        ));
    }
    if settings.ssh_key.is_some() {
        return Err(CheckoutError::Conflict(
            "an SSH checkout needs a native git client, which is unavailable; the archive \
             download only supports token auth"
                .to_string(),
        ));
    }

    let resolved_ref = match (
        settings.git_ref.as_deref().filter(|r| !r.is_empty()),
        settings.commit.as_deref().filter(|c| !c.is_empty()),
    ) {
        (None, None) => {
            info!("determining the default branch");
            Some(api.default_branch(&settings.repository)?)
        }
        _ => settings.git_ref.clone(),
    };
    let target = settings
        .commit
        .clone()
        .filter(|c| !c.is_empty())
        .or_else(|| resolved_ref.clone())
        .unwrap_or_default();

    api.download_tarball(&settings.repository, &target, &settings.repository_path)?;

    Ok(CheckoutOutcome {
        method: AcquisitionMethod::Archive,
        repository_path: settings.repository_path.clone(),
        ref_: resolved_ref,
        commit: settings.commit.clone().filter(|c| !c.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubmoduleMode;
    use tempfile::tempdir;

    fn settings(root: &Path) -> CheckoutSettings {
        CheckoutSettings {
            repository: "octocat/hello-world".parse().unwrap(),
            repository_path: root.join("checkout"),
            git_ref: Some("refs/heads/work".to_string()),
            commit: None,
            fetch_depth: 0,
            clean: false,
            submodules: SubmoduleMode::None,
            lfs: false,
            persist_credentials: false,
            submodules_remote_branch: None,
            ssh_key: None,
            ssh_known_hosts: None,
            ssh_strict: true,
            auth_token: String::new(),
            server_url: "https://github.com".to_string(),
            sparse_checkout: None,
            set_safe_directory: false,
            state_file: root.join("state.json"),
        }
    }

    #[test]
    fn method_display_is_stable() {
        assert_eq!(AcquisitionMethod::Git.to_string(), "git");
        assert_eq!(AcquisitionMethod::Archive.to_string(), "archive");
    }

    #[test]
    fn missing_git_without_lfs_falls_back_to_archive() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let settings = settings(temp_dir.path());

        let client = resolve_client_with("/nonexistent/ghco-test-git", &settings)
            .expect("fallback should not be an error");
        assert!(client.is_none());
    }

    #[test]
    fn missing_git_with_lfs_is_a_capability_error() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let mut settings = settings(temp_dir.path());
        settings.lfs = true;

        let result = resolve_client_with("/nonexistent/ghco-test-git", &settings);
        assert!(matches!(result, Err(CheckoutError::Capability(_))));
    }

    #[test]
    fn archive_with_submodules_is_a_conflict_before_any_download() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let mut settings = settings(temp_dir.path());
        settings.submodules = SubmoduleMode::Shallow;
        let api = GitHubApi::new(&settings.server_url, &settings.auth_token);

        let result = acquire_archive(&api, &settings, "https://github.com/o/r.git", false);
        assert!(matches!(result, Err(CheckoutError::Conflict(_))));
    }

    #[test]
    fn archive_with_ssh_key_is_a_conflict_before_any_download() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let mut settings = settings(temp_dir.path());
        settings.ssh_key = Some("key material".to_string());
        let api = GitHubApi::new(&settings.server_url, &settings.auth_token);

        let result = acquire_archive(&api, &settings, "https://github.com/o/r.git", false);
        assert!(matches!(result, Err(CheckoutError::Conflict(_))));
    }

    mod driver_git_tests {
        use super::*;

        fn git_tests_enabled() -> bool {
            match std::env::var("GHCO_RUN_GIT_TESTS") {
                Ok(value) => {
                    let value = value.to_ascii_lowercase();
                    value == "1" || value == "true" || value == "yes"
                }
                Err(_) => false,
            }
        }

        fn require_git() -> bool {
            if git_tests_enabled() {
                true
            } else {
                eprintln!("skipping git test (set GHCO_RUN_GIT_TESTS=1)");
                false
            }
        }

        fn git(dir: &Path, args: &[&str]) -> String {
            let output = std::process::Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(args)
                .env("GIT_TERMINAL_PROMPT", "0")
                .output()
                .expect("spawn git");
            assert!(
                output.status.success(),
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }

        /// A file:// server layout matching `{server}/{owner}/{repo}.git`
        /// so `repository_url()` resolves to a local upstream.
        fn serve_upstream(root: &Path) -> (String, String) {
            let upstream = root
                .join("srv")
                .join("octocat")
                .join("hello-world.git");
            std::fs::create_dir_all(&upstream).expect("mkdir");
            git(&upstream, &["init"]);
            git(
                &upstream,
                &["config", "uploadpack.allowAnySHA1InWant", "true"],
            );
            std::fs::write(upstream.join("README"), "hello").expect("write");
            git(&upstream, &["add", "."]);
            git(
                &upstream,
                &[
                    "-c",
                    "user.email=test@example.com",
                    "-c",
                    "user.name=Test",
                    "commit",
                    "-m",
                    "init",
                ],
            );
            git(&upstream, &["branch", "-M", "work"]);
            let head = git(&upstream, &["rev-parse", "HEAD"]);
            let server_url = format!("file://{}", root.join("srv").display());
            (server_url, head)
        }

        #[test]
        fn acquires_a_branch_end_to_end() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let (server_url, head) = serve_upstream(temp_dir.path());
            let mut settings = settings(temp_dir.path());
            settings.server_url = server_url;

            let outcome = acquire(&settings).expect("acquire");
            assert_eq!(outcome.method, AcquisitionMethod::Git);
            assert_eq!(outcome.commit.as_deref(), Some(head.as_str()));
            assert_eq!(outcome.ref_.as_deref(), Some("refs/heads/work"));
            assert!(settings.repository_path.join("README").exists());
            assert!(settings.repository_path.join(".git").is_dir());
            assert!(settings.state_file.exists());
            assert_eq!(
                git(&settings.repository_path, &["branch", "--show-current"]),
                "work"
            );
        }

        #[test]
        fn reacquiring_reuses_the_repository() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let (server_url, head) = serve_upstream(temp_dir.path());
            let mut settings = settings(temp_dir.path());
            settings.server_url = server_url;

            acquire(&settings).expect("first acquire");
            std::fs::write(settings.repository_path.join("scratch.txt"), "scratch")
                .expect("write");
            settings.clean = true;

            let outcome = acquire(&settings).expect("second acquire");
            assert_eq!(outcome.commit.as_deref(), Some(head.as_str()));
            assert!(!settings.repository_path.join("scratch.txt").exists());
            assert!(settings.repository_path.join("README").exists());
        }

        #[test]
        fn pinned_commit_wins_over_a_moved_branch() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let (server_url, pinned) = serve_upstream(temp_dir.path());
            let upstream = temp_dir
                .path()
                .join("srv")
                .join("octocat")
                .join("hello-world.git");
            std::fs::write(upstream.join("second"), "more").expect("write");
            git(&upstream, &["add", "."]);
            git(
                &upstream,
                &[
                    "-c",
                    "user.email=test@example.com",
                    "-c",
                    "user.name=Test",
                    "commit",
                    "-m",
                    "second",
                ],
            );

            let mut settings = settings(temp_dir.path());
            settings.server_url = server_url;
            settings.commit = Some(pinned.clone());

            let outcome = acquire(&settings).expect("acquire");
            assert_eq!(outcome.commit.as_deref(), Some(pinned.as_str()));
            assert_eq!(
                git(&settings.repository_path, &["rev-parse", "HEAD"]),
                pinned
            );
        }

        #[test]
        fn cleanup_removes_the_state_file() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let (server_url, _) = serve_upstream(temp_dir.path());
            let mut settings = settings(temp_dir.path());
            settings.server_url = server_url;

            acquire(&settings).expect("acquire");
            assert!(settings.state_file.exists());
            cleanup(&settings.state_file).expect("cleanup");
            assert!(!settings.state_file.exists());
            cleanup(&settings.state_file).expect("cleanup is idempotent");
        }
    }
}
