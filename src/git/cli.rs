//! Spawned-git client with security hardening.
//!
//! Every command runs with prompts disabled and stdin closed, so a
//! credential misconfiguration fails fast instead of hanging a pipeline.
//! Environment overrides (HOME, GIT_SSH_COMMAND) are carried on the
//! client and applied to each spawned command.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use crate::git::version::{
    self, GitVersion, MINIMUM_GIT_LFS_VERSION, MINIMUM_GIT_VERSION,
};
use crate::git::{GitError, TAGS_REFSPEC, validate_git_ref, validate_refspec};

/// Options for a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Limit history to this many commits; `None` (or 0) fetches
    /// everything and unshallows an already-shallow repository.
    pub depth: Option<u32>,
}

/// Which configuration file a config operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Local,
    Global,
}

impl ConfigScope {
    fn flag(self) -> &'static str {
        match self {
            ConfigScope::Local => "--local",
            ConfigScope::Global => "--global",
        }
    }
}

/// The commit currently checked out, as reported by `git log -1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub parents: Vec<String>,
    pub subject: String,
}

/// Git CLI wrapper with security hardening.
///
/// Construction probes the binary and enforces minimum versions, so a
/// `GitCli` in hand is a usable client. Callers that can fall back to
/// another acquisition method treat construction failure as "no native
/// client available".
pub struct GitCli {
    git_path: String,
    work_dir: PathBuf,
    env: HashMap<String, String>,
    lfs: bool,
    version: GitVersion,
    lfs_version: Option<GitVersion>,
}

impl GitCli {
    /// Create a client for `work_dir` using the system git.
    ///
    /// Requires git 2.18 or newer; with `lfs`, additionally requires a
    /// working `git lfs` 2.1 or newer.
    pub fn open(work_dir: &Path, lfs: bool) -> Result<Self, GitError> {
        Self::with_git_path("git", work_dir, lfs)
    }

    /// Like [`GitCli::open`] but with an explicit git binary.
    pub fn with_git_path(
        git_path: impl Into<String>,
        work_dir: &Path,
        lfs: bool,
    ) -> Result<Self, GitError> {
        let git_path = git_path.into();

        let banner = probe(&git_path, &["version"])?;
        let version = version::parse(&banner)
            .ok_or_else(|| GitError::Parse(format!("unrecognized git version banner: {banner}")))?;
        if version < MINIMUM_GIT_VERSION {
            return Err(GitError::Capability(format!(
                "git {version} is below the minimum supported version {MINIMUM_GIT_VERSION}"
            )));
        }

        let lfs_version = if lfs {
            let banner = probe(&git_path, &["lfs", "version"])?;
            let lfs_version = version::parse(&banner).ok_or_else(|| {
                GitError::Parse(format!("unrecognized git-lfs version banner: {banner}"))
            })?;
            if lfs_version < MINIMUM_GIT_LFS_VERSION {
                return Err(GitError::Capability(format!(
                    "git-lfs {lfs_version} is below the minimum supported version {MINIMUM_GIT_LFS_VERSION}"
                )));
            }
            Some(lfs_version)
        } else {
            None
        };

        Ok(Self {
            git_path,
            work_dir: work_dir.to_path_buf(),
            env: HashMap::new(),
            lfs,
            version,
            lfs_version,
        })
    }

    pub fn version(&self) -> GitVersion {
        self.version
    }

    pub fn lfs_version(&self) -> Option<GitVersion> {
        self.lfs_version
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Set an environment override applied to every spawned command.
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    /// Drop an environment override.
    pub fn remove_env(&mut self, key: &str) {
        self.env.remove(key);
    }

    /// Read back an environment override.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `GCM_INTERACTIVE=Never` - disable credential manager prompts
    /// - `GIT_LFS_SKIP_SMUDGE=1` - no surprise LFS downloads unless LFS
    ///   content was explicitly requested
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.arg("-C").arg(&self.work_dir);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.env("GCM_INTERACTIVE", "Never");
        if !self.lfs {
            cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    fn run<I, S>(&self, action: &str, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.command().args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GitError::Command {
                action: action.to_string(),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_raw<I, S>(&self, args: I) -> Result<Output, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Ok(self.command().args(args).output()?)
    }

    /// Initialize an empty repository in the working directory.
    pub fn init(&self) -> Result<(), GitError> {
        self.run("init", ["init"]).map(drop)
    }

    /// Add a remote.
    pub fn remote_add(&self, name: &str, url: &str) -> Result<(), GitError> {
        self.run("remote add", ["remote", "add", name, url])
            .map(drop)
    }

    /// Fetch from origin with protocol v2.
    ///
    /// Tags are skipped unless the refspec set mirrors them explicitly.
    /// With no depth, a shallow repository is unshallowed as part of the
    /// fetch so full-history requests actually get full history.
    pub fn fetch(&self, refspecs: &[String], options: &FetchOptions) -> Result<(), GitError> {
        for refspec in refspecs {
            validate_refspec(refspec)?;
        }

        let mut args: Vec<String> = vec![
            "-c".into(),
            "protocol.version=2".into(),
            "fetch".into(),
        ];
        if !refspecs.iter().any(|r| r == TAGS_REFSPEC) {
            args.push("--no-tags".into());
        }
        args.push("--prune".into());
        args.push("--no-recurse-submodules".into());
        match options.depth {
            Some(depth) if depth > 0 => args.push(format!("--depth={depth}")),
            _ => {
                if self.work_dir.join(".git").join("shallow").exists() {
                    args.push("--unshallow".into());
                }
            }
        }
        args.push("origin".into());
        args.extend(refspecs.iter().cloned());

        self.run("fetch", &args).map(drop)
    }

    /// Check out `ref_`, forcing the working tree to match.
    ///
    /// With a start point, (re)creates the branch `ref_` at `start_point`
    /// and checks it out.
    pub fn checkout(&self, ref_: &str, start_point: Option<&str>) -> Result<(), GitError> {
        validate_git_ref(ref_, "ref")?;

        let mut args: Vec<String> = vec!["checkout".into(), "--force".into()];
        match start_point {
            Some(start_point) => {
                validate_git_ref(start_point, "start point")?;
                args.push("-B".into());
                args.push(ref_.into());
                args.push(start_point.into());
            }
            None => args.push(ref_.into()),
        }

        self.run("checkout", &args).map(drop)
    }

    /// Detach HEAD from the current branch.
    pub fn checkout_detach(&self) -> Result<(), GitError> {
        self.run("checkout", ["checkout", "--detach"]).map(drop)
    }

    /// Whether HEAD is detached.
    pub fn is_detached(&self) -> Result<bool, GitError> {
        let output = self.run_raw(["symbolic-ref", "-q", "HEAD"])?;
        Ok(!output.status.success())
    }

    /// Local or remote-tracking branch names.
    pub fn branch_list(&self, remote: bool) -> Result<Vec<String>, GitError> {
        let prefix = if remote {
            "refs/remotes/origin"
        } else {
            "refs/heads"
        };
        let stdout = self.run(
            "for-each-ref",
            ["for-each-ref", "--format=%(refname:short)", prefix],
        )?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Delete a local or remote-tracking branch.
    pub fn branch_delete(&self, remote: bool, branch: &str) -> Result<(), GitError> {
        validate_git_ref(branch, "branch")?;
        let mut args = vec!["branch", "-D"];
        if remote {
            args.push("-r");
        }
        args.push(branch);
        self.run("branch delete", &args).map(drop)
    }

    /// Whether a branch matching `pattern` exists locally (or among
    /// remote-tracking refs when `remote`).
    pub fn branch_exists(&self, remote: bool, pattern: &str) -> Result<bool, GitError> {
        validate_git_ref(pattern, "branch pattern")?;
        let mut args = vec!["branch", "--list"];
        if remote {
            args.push("--remote");
        }
        args.push(pattern);
        let stdout = self.run("branch list", &args)?;
        Ok(!stdout.trim().is_empty())
    }

    /// Whether a tag matching `pattern` exists.
    pub fn tag_exists(&self, pattern: &str) -> Result<bool, GitError> {
        validate_git_ref(pattern, "tag pattern")?;
        let stdout = self.run("tag list", ["tag", "--list", pattern])?;
        Ok(!stdout.trim().is_empty())
    }

    /// Whether `sha` names an object present locally.
    pub fn sha_exists(&self, sha: &str) -> Result<bool, GitError> {
        validate_git_ref(sha, "commit")?;
        let spec = format!("{sha}^{{object}}");
        let output = self.run_raw(["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(output.status.success())
    }

    /// Resolve a revision to its full SHA.
    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        validate_git_ref(rev, "revision")?;
        let stdout = self.run("rev-parse", ["rev-parse", rev])?;
        Ok(stdout.trim().to_string())
    }

    /// Whether `branch` exists on the `origin` remote. Talks to the
    /// network.
    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        validate_git_ref(branch, "branch")?;
        let refname = format!("refs/heads/{branch}");
        let stdout = self.run("ls-remote", ["ls-remote", "--heads", "origin", &refname])?;
        Ok(!stdout.trim().is_empty())
    }

    /// Resolve the default branch of a remote repository.
    ///
    /// Returns the fully qualified ref, e.g. `refs/heads/main`.
    pub fn get_default_branch(&self, url: &str) -> Result<String, GitError> {
        let stdout = self.run(
            "ls-remote",
            ["ls-remote", "--quiet", "--exit-code", "--symref", url, "HEAD"],
        )?;
        parse_symref_head(&stdout).ok_or_else(|| {
            GitError::Parse("unexpected ls-remote output when resolving the default branch".into())
        })
    }

    /// Read the commit currently at HEAD.
    pub fn commit_info(&self) -> Result<CommitInfo, GitError> {
        let stdout = self.run("log", ["log", "-1", "--format=%H%n%P%n%s"])?;
        parse_commit_info(&stdout)
            .ok_or_else(|| GitError::Parse(format!("unexpected log output: {stdout}")))
    }

    /// Turn off automatic garbage collection for this repository.
    ///
    /// Best effort; the checkout still works if this fails.
    pub fn try_disable_automatic_gc(&self) -> bool {
        self.run_raw(["config", "--local", "gc.auto", "0"])
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Remove untracked files and directories. Best effort.
    pub fn try_clean(&self) -> bool {
        self.run_raw(["clean", "-ffdx"])
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Hard-reset the working tree to HEAD. Best effort.
    pub fn try_reset_hard(&self) -> bool {
        self.run_raw(["reset", "--hard", "HEAD"])
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Install LFS filters into the repository's local config.
    pub fn lfs_install(&self) -> Result<(), GitError> {
        self.run("lfs install", ["lfs", "install", "--local"])
            .map(drop)
    }

    /// Download LFS content for `ref_`.
    pub fn lfs_fetch(&self, ref_: &str) -> Result<(), GitError> {
        validate_git_ref(ref_, "ref")?;
        self.run("lfs fetch", ["lfs", "fetch", "origin", ref_])
            .map(drop)
    }

    /// Restrict the working tree to the given cone directories.
    pub fn sparse_checkout(&self, patterns: &[String]) -> Result<(), GitError> {
        let mut args: Vec<String> = vec!["sparse-checkout".into(), "set".into()];
        for pattern in patterns {
            validate_git_ref(pattern, "sparse checkout pattern")?;
            args.push(pattern.clone());
        }
        self.run("sparse-checkout", &args).map(drop)
    }

    /// Synchronize submodule URLs from `.gitmodules` into config.
    pub fn submodule_sync(&self, recursive: bool) -> Result<(), GitError> {
        let mut args = vec!["submodule", "sync"];
        if recursive {
            args.push("--recursive");
        }
        self.run("submodule sync", &args).map(drop)
    }

    /// Initialize and update submodules with protocol v2.
    pub fn submodule_update(&self, recursive: bool, depth: Option<u32>) -> Result<(), GitError> {
        let mut args: Vec<String> = vec![
            "-c".into(),
            "protocol.version=2".into(),
            "submodule".into(),
            "update".into(),
            "--init".into(),
            "--force".into(),
        ];
        if let Some(depth) = depth.filter(|d| *d > 0) {
            args.push(format!("--depth={depth}"));
        }
        if recursive {
            args.push("--recursive".into());
        }
        self.run("submodule update", &args).map(drop)
    }

    /// Run a shell command in every initialized submodule.
    pub fn submodule_foreach(&self, recursive: bool, command: &str) -> Result<String, GitError> {
        let mut args = vec!["submodule", "foreach"];
        if recursive {
            args.push("--recursive");
        }
        args.push(command);
        self.run("submodule foreach", &args)
    }

    /// Submodule paths declared in `.gitmodules`, relative to the
    /// working directory. Empty when the file is absent.
    pub fn submodule_paths(&self) -> Result<Vec<String>, GitError> {
        if !self.work_dir.join(".gitmodules").exists() {
            return Ok(Vec::new());
        }
        let output = self.run_raw([
            "config",
            "--file",
            ".gitmodules",
            "--get-regexp",
            r"^submodule\..+\.path$",
        ])?;
        if !output.status.success() {
            // Exit code 1 with no output means no keys matched.
            if output.status.code() == Some(1) && output.stdout.is_empty() {
                return Ok(Vec::new());
            }
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GitError::Command {
                action: "config --get-regexp".to_string(),
                stderr,
            });
        }
        Ok(parse_submodule_paths(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    /// Set a config key, replacing any existing value.
    pub fn config_set(&self, scope: ConfigScope, key: &str, value: &str) -> Result<(), GitError> {
        self.run("config", ["config", scope.flag(), key, value])
            .map(drop)
    }

    /// Append a value to a multi-valued config key.
    pub fn config_add(&self, scope: ConfigScope, key: &str, value: &str) -> Result<(), GitError> {
        self.run("config", ["config", scope.flag(), "--add", key, value])
            .map(drop)
    }

    /// Whether a config key has any value in the given scope.
    pub fn config_exists(&self, scope: ConfigScope, key: &str) -> Result<bool, GitError> {
        let output = self.run_raw(["config", scope.flag(), "--get-all", key])?;
        Ok(output.status.success())
    }

    /// Remove all values of a config key. Returns false when nothing
    /// was removed.
    pub fn try_config_unset(&self, scope: ConfigScope, key: &str) -> bool {
        self.run_raw(["config", scope.flag(), "--unset-all", key])
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

fn probe(git_path: &str, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new(git_path)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                GitError::Capability(format!("{git_path} was not found on PATH"))
            }
            _ => GitError::Io(e),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::Capability(format!(
            "`{git_path} {}` failed: {stderr}",
            args.join(" ")
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract `refs/heads/<branch>` from `ls-remote --symref <url> HEAD`.
fn parse_symref_head(output: &str) -> Option<String> {
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("ref:") {
            if let Some(refname) = rest.strip_suffix("HEAD") {
                let refname = refname.trim();
                if !refname.is_empty() {
                    return Some(refname.to_string());
                }
            }
        }
    }
    None
}

/// Parse the `%H%n%P%n%s` shape produced for [`GitCli::commit_info`].
fn parse_commit_info(output: &str) -> Option<CommitInfo> {
    let mut lines = output.lines();
    let sha = lines.next()?.trim().to_string();
    if sha.is_empty() {
        return None;
    }
    let parents = lines
        .next()
        .unwrap_or("")
        .split_whitespace()
        .map(String::from)
        .collect();
    let subject = lines.next().unwrap_or("").trim().to_string();
    Some(CommitInfo {
        sha,
        parents,
        subject,
    })
}

/// Parse `git config --get-regexp ^submodule\..+\.path$` output.
fn parse_submodule_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once(' '))
        .map(|(_, path)| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}
