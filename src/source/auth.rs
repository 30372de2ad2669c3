//! Credential configuration for git transports.
//!
//! Token auth is installed as an HTTP extra header in git config. The
//! header is first written with a placeholder value through the git
//! binary and then substituted directly in the config file, keeping
//! the credential out of process command lines and audit logs. SSH
//! auth writes the key to a mode-0600 temp file and routes the
//! transport through `GIT_SSH_COMMAND`.
//!
//! Submodule operations clone into nested repositories that do not see
//! the parent's local config, so the same header can be installed in a
//! temporary global config under an overridden `HOME` for the duration
//! of the submodule phase.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use log::{debug, info, warn};

use crate::git::{ConfigScope, GitCli};
use crate::settings::CheckoutSettings;
use crate::source::CheckoutError;
use crate::state::RunState;

const EXTRA_HEADER_PLACEHOLDER: &str = "AUTHORIZATION: basic ***";
const SSH_COMMAND_KEY: &str = "core.sshCommand";
const GITHUB_KNOWN_HOST: &str =
    "github.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path(prefix: &str) -> PathBuf {
    let count = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}-{}-{count}", std::process::id()))
}

/// Config key holding the token header for one server.
pub fn extra_header_key(server_url: &str) -> String {
    format!("http.{}/.extraheader", server_url.trim_end_matches('/'))
}

/// Config key rewriting SSH remote URLs onto the token transport.
pub fn insteadof_key(server_url: &str) -> String {
    format!("url.{}/.insteadOf", server_url.trim_end_matches('/'))
}

fn ssh_command_line(key_path: &Path, strict: bool, known_hosts_path: &Path) -> String {
    let mut command = format!("ssh -i \"{}\"", key_path.display());
    if strict {
        command.push_str(" -o StrictHostKeyChecking=yes -o CheckHostIP=no");
    }
    command.push_str(&format!(
        " -o \"UserKnownHostsFile={}\"",
        known_hosts_path.display()
    ));
    command
}

fn escape_regexp(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if "[](){}.*+?^$|\\".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Config file paths out of `--show-origin` output, one per submodule.
fn parse_config_paths(output: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for token in output.split_whitespace() {
        let token = token.strip_prefix("file:").unwrap_or(token);
        if token.starts_with('/') && token.ends_with("/config") {
            paths.push(token.to_string());
        }
    }
    paths
}

fn remove_key(git: &GitCli, key: &str) -> Result<(), CheckoutError> {
    if git.config_exists(ConfigScope::Local, key)? && !git.try_config_unset(ConfigScope::Local, key)
    {
        warn!("failed to remove '{key}' from the git config");
    }
    if git.work_dir().join(".gitmodules").exists() {
        let command = format!(
            "sh -c \"git config --local --name-only --get-regexp '{}' && \
             git config --local --unset-all '{key}' || :\"",
            escape_regexp(key)
        );
        if let Err(e) = git.submodule_foreach(true, &command) {
            debug!("skipping submodule config removal: {e}");
        }
    }
    Ok(())
}

/// Credential state for one acquisition. All configuration this
/// installs can be reversed with [`AuthConfig::remove`] and
/// [`AuthConfig::remove_global`].
pub struct AuthConfig<'a> {
    settings: &'a CheckoutSettings,
    token_config_key: String,
    insteadof_key: String,
    insteadof_value: String,
    extra_header: String,
    ssh_command: Option<String>,
    ssh_key_path: Option<PathBuf>,
    ssh_known_hosts_path: Option<PathBuf>,
    temp_home: Option<PathBuf>,
}

impl<'a> AuthConfig<'a> {
    pub fn new(settings: &'a CheckoutSettings) -> Self {
        let origin = settings.server_origin();
        let credential = base64::engine::general_purpose::STANDARD
            .encode(format!("x-access-token:{}", settings.auth_token));
        AuthConfig {
            settings,
            token_config_key: extra_header_key(origin),
            insteadof_key: insteadof_key(origin),
            insteadof_value: format!("git@{}:", settings.server_host()),
            extra_header: format!("AUTHORIZATION: basic {credential}"),
            ssh_command: None,
            ssh_key_path: None,
            ssh_known_hosts_path: None,
            temp_home: None,
        }
    }

    /// Install credentials into the repository's local configuration,
    /// clearing any stale configuration from a previous run first.
    pub fn configure(&mut self, git: &mut GitCli) -> Result<(), CheckoutError> {
        self.remove(git)?;
        self.configure_ssh(git)?;
        let config_path = git.work_dir().join(".git").join("config");
        self.configure_token(git, ConfigScope::Local, &config_path)
    }

    /// Point `HOME` at a scratch directory seeded with a copy of the
    /// user's gitconfig, so global config writes never touch the real
    /// one. Reuses the scratch directory once created.
    pub fn configure_temp_global(&mut self, git: &mut GitCli) -> Result<PathBuf, CheckoutError> {
        if let Some(temp_home) = &self.temp_home {
            return Ok(temp_home.clone());
        }
        let temp_home = temp_path("ghco-home");
        fs::create_dir_all(&temp_home)?;
        let global_config = temp_home.join(".gitconfig");
        match dirs::home_dir().map(|home| home.join(".gitconfig")) {
            Some(user_config) if user_config.exists() => {
                fs::copy(&user_config, &global_config)?;
                debug!("copied {} to {}", user_config.display(), global_config.display());
            }
            _ => fs::write(&global_config, "")?,
        }
        git.set_env("HOME", &temp_home.display().to_string());
        self.temp_home = Some(temp_home.clone());
        Ok(temp_home)
    }

    /// Temporarily broaden the token header to global configuration
    /// for operations that clone nested repositories. Must be reversed
    /// with [`AuthConfig::remove_global`].
    pub fn configure_global(&mut self, git: &mut GitCli) -> Result<(), CheckoutError> {
        let temp_home = self.configure_temp_global(git)?;
        let result = self.configure_global_config(git, &temp_home.join(".gitconfig"));
        if result.is_err() {
            info!("failed to configure global auth, unconfiguring");
            git.try_config_unset(ConfigScope::Global, &self.token_config_key);
        }
        result
    }

    fn configure_global_config(
        &self,
        git: &GitCli,
        global_config: &Path,
    ) -> Result<(), CheckoutError> {
        self.configure_token(git, ConfigScope::Global, global_config)?;
        git.try_config_unset(ConfigScope::Global, &self.insteadof_key);
        if self.settings.ssh_key.is_none() {
            git.config_add(ConfigScope::Global, &self.insteadof_key, &self.insteadof_value)?;
        }
        Ok(())
    }

    /// Persist credentials into each submodule's own local config.
    pub fn configure_submodules(&self, git: &GitCli) -> Result<(), CheckoutError> {
        let recursive = self.settings.submodules.recursive();

        // A placeholder lands in every submodule config through the
        // git binary, then each file gets the real value substituted.
        let output = git.submodule_foreach(
            recursive,
            &format!(
                "sh -c \"git config --local '{}' '{EXTRA_HEADER_PLACEHOLDER}' && \
                 git config --local --show-origin --name-only --get-regexp remote.origin.url\"",
                self.token_config_key
            ),
        )?;
        for config_path in parse_config_paths(&output) {
            self.replace_token_placeholder(Path::new(&config_path))?;
        }

        if let Some(ssh_command) = &self.ssh_command {
            git.submodule_foreach(
                recursive,
                &format!("git config --local '{SSH_COMMAND_KEY}' '{ssh_command}'"),
            )?;
        } else {
            git.submodule_foreach(
                recursive,
                &format!(
                    "git config --local --add '{}' '{}'",
                    self.insteadof_key, self.insteadof_value
                ),
            )?;
        }
        Ok(())
    }

    /// Reverse everything [`AuthConfig::configure`] installed.
    pub fn remove(&mut self, git: &mut GitCli) -> Result<(), CheckoutError> {
        self.remove_ssh_files();
        git.remove_env("GIT_SSH_COMMAND");
        remove_key(git, SSH_COMMAND_KEY)?;
        remove_key(git, &self.token_config_key)?;
        Ok(())
    }

    /// Drop the scratch `HOME` and restore the inherited one.
    pub fn remove_global(&mut self, git: &mut GitCli) {
        if let Some(temp_home) = self.temp_home.take() {
            if let Err(e) = fs::remove_dir_all(&temp_home) {
                warn!(
                    "failed to remove temporary global config at {}: {e}",
                    temp_home.display()
                );
            }
        }
        git.remove_env("HOME");
    }

    pub fn ssh_key_path(&self) -> Option<&Path> {
        self.ssh_key_path.as_deref()
    }

    pub fn ssh_known_hosts_path(&self) -> Option<&Path> {
        self.ssh_known_hosts_path.as_deref()
    }

    fn configure_ssh(&mut self, git: &mut GitCli) -> Result<(), CheckoutError> {
        let Some(ssh_key) = &self.settings.ssh_key else {
            return Ok(());
        };

        let key_path = temp_path("ghco-key");
        fs::write(&key_path, format!("{}\n", ssh_key.trim()))?;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        self.ssh_key_path = Some(key_path.clone());

        let mut known_hosts = String::new();
        if let Some(user_hosts) = dirs::home_dir()
            .map(|home| home.join(".ssh").join("known_hosts"))
            .and_then(|path| fs::read_to_string(path).ok())
        {
            known_hosts.push_str(&user_hosts);
            if !known_hosts.ends_with('\n') {
                known_hosts.push('\n');
            }
        }
        if let Some(extra) = &self.settings.ssh_known_hosts {
            known_hosts.push_str(extra.trim());
            known_hosts.push('\n');
        }
        known_hosts.push_str(GITHUB_KNOWN_HOST);
        known_hosts.push('\n');
        let known_hosts_path = temp_path("ghco-known-hosts");
        fs::write(&known_hosts_path, known_hosts)?;
        self.ssh_known_hosts_path = Some(known_hosts_path.clone());

        let ssh_command =
            ssh_command_line(&key_path, self.settings.ssh_strict, &known_hosts_path);
        info!("temporarily overriding GIT_SSH_COMMAND={ssh_command}");
        git.set_env("GIT_SSH_COMMAND", &ssh_command);
        if self.settings.persist_credentials {
            git.config_set(ConfigScope::Local, SSH_COMMAND_KEY, &ssh_command)?;
        }
        self.ssh_command = Some(ssh_command);
        Ok(())
    }

    fn configure_token(
        &self,
        git: &GitCli,
        scope: ConfigScope,
        config_path: &Path,
    ) -> Result<(), CheckoutError> {
        git.config_set(scope, &self.token_config_key, EXTRA_HEADER_PLACEHOLDER)?;
        self.replace_token_placeholder(config_path)
    }

    fn replace_token_placeholder(&self, config_path: &Path) -> Result<(), CheckoutError> {
        let content = fs::read_to_string(config_path)?;
        let first = content.find(EXTRA_HEADER_PLACEHOLDER);
        if first.is_none() || first != content.rfind(EXTRA_HEADER_PLACEHOLDER) {
            return Err(CheckoutError::Auth(format!(
                "unable to replace the auth placeholder in {}",
                config_path.display()
            )));
        }
        let content = content.replacen(EXTRA_HEADER_PLACEHOLDER, &self.extra_header, 1);
        fs::write(config_path, content)?;
        Ok(())
    }

    fn remove_ssh_files(&mut self) {
        let paths = [self.ssh_key_path.take(), self.ssh_known_hosts_path.take()];
        for path in paths.into_iter().flatten() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove '{}': {e}", path.display());
                }
            }
        }
    }
}

/// Run `body` with credentials configured, removing them on every exit
/// path unless persistence was requested. Configuration can fail after
/// the SSH key file is already on disk, so a failed configure gets the
/// same removal treatment as a failed body. A removal failure surfaces
/// only when the earlier steps succeeded, so it never masks the
/// original error.
pub fn with_auth<T>(
    auth: &mut AuthConfig,
    git: &mut GitCli,
    body: impl FnOnce(&mut GitCli, &mut AuthConfig) -> Result<T, CheckoutError>,
) -> Result<T, CheckoutError> {
    info!("setting up auth");
    if auth.settings.has_auth() {
        if let Err(e) = auth.configure(git) {
            if !auth.settings.persist_credentials {
                if let Err(removal) = auth.remove(git) {
                    warn!("credential removal failed after an earlier error: {removal}");
                }
            }
            return Err(e);
        }
    }
    let result = body(git, auth);
    if auth.settings.persist_credentials {
        return result;
    }
    info!("removing auth");
    match (result, auth.remove(git)) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(removal)) => Err(removal),
        (Err(original), Ok(())) => Err(original),
        (Err(original), Err(removal)) => {
            warn!("credential removal failed after an earlier error: {removal}");
            Err(original)
        }
    }
}

/// Delete key material recorded by an earlier run.
pub fn remove_recorded_files(state: &RunState) {
    let paths = [&state.ssh_key_path, &state.ssh_known_hosts_path];
    for path in paths.into_iter().flatten() {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove '{}': {e}", path.display());
            }
        }
    }
}

/// Remove credential configuration and key material recorded by an
/// earlier run, using the paths persisted in its state.
pub fn remove_recorded(git: &GitCli, state: &RunState) -> Result<(), CheckoutError> {
    remove_recorded_files(state);
    let server_url = state.server_url.trim_end_matches('/');
    remove_key(git, SSH_COMMAND_KEY)?;
    remove_key(git, &extra_header_key(server_url))?;
    remove_key(git, &insteadof_key(server_url))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubmoduleMode;

    fn settings(token: &str) -> CheckoutSettings {
        CheckoutSettings {
            repository: "octocat/hello-world".parse().unwrap(),
            repository_path: PathBuf::from("/work/checkout"),
            git_ref: Some("refs/heads/main".to_string()),
            commit: None,
            fetch_depth: 1,
            clean: true,
            submodules: SubmoduleMode::None,
            lfs: false,
            persist_credentials: false,
            submodules_remote_branch: None,
            ssh_key: None,
            ssh_known_hosts: None,
            ssh_strict: true,
            auth_token: token.to_string(),
            server_url: "https://github.com".to_string(),
            sparse_checkout: None,
            set_safe_directory: false,
            state_file: PathBuf::from(".ghco-state.json"),
        }
    }

    #[test]
    fn extra_header_key_strips_trailing_slash() {
        assert_eq!(
            extra_header_key("https://github.com/"),
            "http.https://github.com/.extraheader"
        );
        assert_eq!(
            extra_header_key("https://ghe.example.org"),
            "http.https://ghe.example.org/.extraheader"
        );
    }

    #[test]
    fn insteadof_key_strips_trailing_slash() {
        assert_eq!(
            insteadof_key("https://github.com/"),
            "url.https://github.com/.insteadOf"
        );
        assert_eq!(
            insteadof_key("https://ghe.example.org"),
            "url.https://ghe.example.org/.insteadOf"
        );
    }

    #[test]
    fn ssh_command_includes_strict_options() {
        let command = ssh_command_line(
            Path::new("/tmp/key"),
            true,
            Path::new("/tmp/known_hosts"),
        );
        assert_eq!(
            command,
            "ssh -i \"/tmp/key\" -o StrictHostKeyChecking=yes -o CheckHostIP=no \
             -o \"UserKnownHostsFile=/tmp/known_hosts\""
        );
    }

    #[test]
    fn ssh_command_without_strict_options() {
        let command = ssh_command_line(
            Path::new("/tmp/key"),
            false,
            Path::new("/tmp/known_hosts"),
        );
        assert_eq!(
            command,
            "ssh -i \"/tmp/key\" -o \"UserKnownHostsFile=/tmp/known_hosts\""
        );
    }

    #[test]
    fn parse_config_paths_extracts_submodule_configs() {
        let output = "Entering 'vendor/lib'\n\
                      file:/work/checkout/.git/modules/vendor/lib/config\tremote.origin.url\n\
                      Entering 'vendor/other'\n\
                      file:/work/checkout/.git/modules/vendor/other/config\tremote.origin.url\n";
        assert_eq!(
            parse_config_paths(output),
            vec![
                "/work/checkout/.git/modules/vendor/lib/config".to_string(),
                "/work/checkout/.git/modules/vendor/other/config".to_string(),
            ]
        );
    }

    #[test]
    fn parse_config_paths_ignores_unrelated_output() {
        assert_eq!(parse_config_paths("Entering 'vendor/lib'\n"), Vec::<String>::new());
    }

    #[test]
    fn escape_regexp_escapes_metacharacters() {
        assert_eq!(
            escape_regexp("http.https://github.com/.extraheader"),
            "http\\.https://github\\.com/\\.extraheader"
        );
    }

    mod auth_git_tests {
        use super::*;
        use crate::git::GitCli;
        use tempfile::tempdir;

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

        #[test]
        fn token_lands_in_config_without_placeholder() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let mut git = GitCli::open(temp_dir.path(), false).expect("git available");
            git.init().expect("init");

            let settings = settings("token-value");
            let mut auth = AuthConfig::new(&settings);
            auth.configure(&mut git).expect("configure");

            let config = std::fs::read_to_string(temp_dir.path().join(".git").join("config"))
                .expect("read config");
            let credential = base64::engine::general_purpose::STANDARD
                .encode("x-access-token:token-value");
            assert!(config.contains(&format!("AUTHORIZATION: basic {credential}")));
            assert!(!config.contains("***"));
        }

        #[test]
        fn remove_clears_the_header() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let mut git = GitCli::open(temp_dir.path(), false).expect("git available");
            git.init().expect("init");

            let settings = settings("token-value");
            let mut auth = AuthConfig::new(&settings);
            auth.configure(&mut git).expect("configure");
            auth.remove(&mut git).expect("remove");

            let key = extra_header_key("https://github.com");
            assert!(!git
                .config_exists(ConfigScope::Local, &key)
                .expect("config exists"));
        }

        #[test]
        fn with_auth_removes_on_failure() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let mut git = GitCli::open(temp_dir.path(), false).expect("git available");
            git.init().expect("init");

            let settings = settings("token-value");
            let mut auth = AuthConfig::new(&settings);
            let result: Result<(), CheckoutError> = with_auth(&mut auth, &mut git, |_, _| {
                Err(CheckoutError::Conflict("boom".to_string()))
            });
            assert!(matches!(result, Err(CheckoutError::Conflict(_))));

            let key = extra_header_key("https://github.com");
            assert!(!git
                .config_exists(ConfigScope::Local, &key)
                .expect("config exists"));
        }

        #[test]
        fn failed_configure_still_removes_key_material() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let mut git = GitCli::open(temp_dir.path(), false).expect("git available");
            git.init().expect("init");

            // A second occurrence of the placeholder makes the token
            // substitution ambiguous, failing configure after the SSH
            // key file has already been written.
            git.config_set(ConfigScope::Local, "ghco.decoy", EXTRA_HEADER_PLACEHOLDER)
                .expect("config set");

            let mut settings = settings("token-value");
            settings.ssh_key = Some("fake key material".to_string());
            let mut auth = AuthConfig::new(&settings);
            let result: Result<(), CheckoutError> =
                with_auth(&mut auth, &mut git, |_, _| unreachable!("body must not run"));
            assert!(matches!(result, Err(CheckoutError::Auth(_))));

            // Removal takes the recorded paths after deleting the
            // files, so cleared paths mean the key material is gone.
            assert!(auth.ssh_key_path().is_none());
            assert!(auth.ssh_known_hosts_path().is_none());
            assert!(git.env("GIT_SSH_COMMAND").is_none());
            let key = extra_header_key("https://github.com");
            assert!(!git
                .config_exists(ConfigScope::Local, &key)
                .expect("config exists"));
        }

        #[test]
        fn ssh_key_is_written_with_restrictive_mode() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let mut git = GitCli::open(temp_dir.path(), false).expect("git available");
            git.init().expect("init");

            let mut settings = settings("token-value");
            settings.ssh_key = Some("fake key material".to_string());
            let mut auth = AuthConfig::new(&settings);
            auth.configure(&mut git).expect("configure");

            let key_path = auth.ssh_key_path().expect("key path").to_path_buf();
            let mode = std::fs::metadata(&key_path)
                .expect("key metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
            assert!(git.env("GIT_SSH_COMMAND").is_some());

            auth.remove(&mut git).expect("remove");
            assert!(!key_path.exists());
            assert!(git.env("GIT_SSH_COMMAND").is_none());
        }

        #[test]
        fn remove_recorded_clears_persisted_config() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let git = GitCli::open(temp_dir.path(), false).expect("git available");
            git.init().expect("init");

            let header_key = extra_header_key("https://github.com");
            let rewrite_key = insteadof_key("https://github.com");
            git.config_set(ConfigScope::Local, &header_key, "AUTHORIZATION: basic abc")
                .expect("config set");
            git.config_set(ConfigScope::Local, SSH_COMMAND_KEY, "ssh -i /tmp/key")
                .expect("config set");
            git.config_add(ConfigScope::Local, &rewrite_key, "git@github.com:")
                .expect("config add");

            let state = RunState {
                repository_path: temp_dir.path().to_path_buf(),
                server_url: "https://github.com/".to_string(),
                ssh_key_path: None,
                ssh_known_hosts_path: None,
            };
            remove_recorded(&git, &state).expect("remove recorded");

            for key in [header_key.as_str(), SSH_COMMAND_KEY, rewrite_key.as_str()] {
                assert!(
                    !git.config_exists(ConfigScope::Local, key).expect("config exists"),
                    "'{key}' survived cleanup"
                );
            }
        }

        #[test]
        fn global_auth_overrides_home() {
            if !require_git() {
                return;
            }
            let temp_dir = tempdir().expect("Failed to create temp directory");
            let mut git = GitCli::open(temp_dir.path(), false).expect("git available");
            git.init().expect("init");

            let settings = settings("token-value");
            let mut auth = AuthConfig::new(&settings);
            auth.configure_global(&mut git).expect("configure global");

            let temp_home = git.env("HOME").expect("HOME override").to_string();
            let global_config =
                std::fs::read_to_string(Path::new(&temp_home).join(".gitconfig"))
                    .expect("read global config");
            assert!(global_config.contains("extraheader"));
            assert!(!global_config.contains("***"));

            auth.remove_global(&mut git);
            assert!(git.env("HOME").is_none());
            assert!(!Path::new(&temp_home).exists());
        }
    }
}
