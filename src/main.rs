pub mod api;
pub mod git;
pub mod settings;
pub mod source;
pub mod state;
pub mod types;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::CheckoutSettings;
use crate::state::DEFAULT_STATE_FILE;
use crate::types::{RepoKey, SubmoduleMode};

#[derive(Parser)]
#[command(
    name = "ghco",
    about = "Check out GitHub repositories for automation pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a repository into a local directory
    Checkout(CheckoutArgs),

    /// Remove credentials a previous checkout left behind
    Cleanup {
        /// State file written by the checkout
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,
    },

    /// Check dependencies
    Doctor,
}

#[derive(clap::Args)]
struct CheckoutArgs {
    /// Repository in owner/repo format
    #[arg(long)]
    repository: RepoKey,

    /// Directory to place the working copy in
    #[arg(long)]
    path: PathBuf,

    /// Branch, tag, or fully qualified ref to check out
    #[arg(long = "ref")]
    git_ref: Option<String>,

    /// Commit SHA to check out
    #[arg(long)]
    commit: Option<String>,

    /// Number of commits to fetch; 0 fetches all history
    #[arg(long, default_value_t = 1)]
    fetch_depth: u32,

    /// Keep untracked files when reusing an existing repository
    #[arg(long)]
    no_clean: bool,

    /// Submodule handling: none, shallow, or recursive
    #[arg(long, default_value_t = SubmoduleMode::None)]
    submodules: SubmoduleMode,

    /// Download Git LFS content for the checked-out ref
    #[arg(long)]
    lfs: bool,

    /// Leave credentials configured for later pipeline steps
    #[arg(long)]
    persist_credentials: bool,

    /// Branch to check out in each submodule that has it on its remote
    #[arg(long)]
    submodules_remote_branch: Option<String>,

    /// File containing an SSH private key; switches to SSH transport
    #[arg(long)]
    ssh_key_file: Option<PathBuf>,

    /// File with extra known-hosts entries for the SSH transport
    #[arg(long)]
    ssh_known_hosts_file: Option<PathBuf>,

    /// Accept unknown SSH host keys
    #[arg(long)]
    no_ssh_strict: bool,

    /// Restrict the working tree to these cone patterns
    #[arg(long, num_args = 1..)]
    sparse_checkout: Option<Vec<String>>,

    /// Base URL of the GitHub instance
    #[arg(long, default_value = "https://github.com")]
    server_url: String,

    /// Mark the checkout as a safe directory during the run
    #[arg(long)]
    set_safe_directory: bool,

    /// Where to record state for a later cleanup
    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// API token; falls back to $GHCO_TOKEN, then $GITHUB_TOKEN
    #[arg(long)]
    token: Option<String>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Checkout(args) => cmd_checkout(args),
        Commands::Cleanup { state_file } => cmd_cleanup(&state_file),
        Commands::Doctor => cmd_doctor(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_checkout(args: CheckoutArgs) -> Result<(), Box<dyn std::error::Error>> {
    let token = match args.token {
        Some(token) => token,
        None => std::env::var("GHCO_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .unwrap_or_default(),
    };
    let ssh_key = args
        .ssh_key_file
        .map(|path| {
            std::fs::read_to_string(&path)
                .map_err(|e| format!("failed to read SSH key from {}: {}", path.display(), e))
        })
        .transpose()?;
    let ssh_known_hosts = args
        .ssh_known_hosts_file
        .map(|path| {
            std::fs::read_to_string(&path)
                .map_err(|e| format!("failed to read known hosts from {}: {}", path.display(), e))
        })
        .transpose()?;

    let settings = CheckoutSettings {
        repository: args.repository,
        repository_path: args.path,
        git_ref: args.git_ref,
        commit: args.commit,
        fetch_depth: args.fetch_depth,
        clean: !args.no_clean,
        submodules: args.submodules,
        lfs: args.lfs,
        persist_credentials: args.persist_credentials,
        submodules_remote_branch: args.submodules_remote_branch,
        ssh_key,
        ssh_known_hosts,
        ssh_strict: !args.no_ssh_strict,
        auth_token: token,
        server_url: args.server_url,
        sparse_checkout: args.sparse_checkout,
        set_safe_directory: args.set_safe_directory,
        state_file: args.state_file,
    };

    let outcome = source::driver::acquire(&settings)?;

    println!("Checked out {}", settings.repository);
    println!("  Method: {}", outcome.method);
    println!("  Path:   {}", outcome.repository_path.display());
    if let Some(ref_) = &outcome.ref_ {
        println!("  Ref:    {}", ref_);
    }
    if let Some(commit) = &outcome.commit {
        println!("  Commit: {}", commit);
    }

    Ok(())
}

fn cmd_cleanup(state_file: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    source::driver::cleanup(state_file)?;
    println!("Cleaned up");
    Ok(())
}

fn cmd_doctor() -> Result<(), Box<dyn std::error::Error>> {
    println!("GHCO System Check\n");

    // Check git
    let git_version = std::process::Command::new("git")
        .args(["--version"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| git::version::parse(&String::from_utf8_lossy(&o.stdout)));
    let git_ok = git_version.is_some_and(|v| v >= git::version::MINIMUM_GIT_VERSION);
    println!(
        "[{}] git: {}",
        if git_ok { "OK" } else { "FAIL" },
        match git_version {
            Some(v) if git_ok => format!("{} (>= {})", v, git::version::MINIMUM_GIT_VERSION),
            Some(v) => format!(
                "{} (need {} or newer; archive fallback only)",
                v,
                git::version::MINIMUM_GIT_VERSION
            ),
            None => "not found (archive fallback only)".to_string(),
        }
    );

    // Check git-lfs
    let lfs_version = std::process::Command::new("git")
        .args(["lfs", "version"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| git::version::parse(&String::from_utf8_lossy(&o.stdout)));
    let lfs_ok = lfs_version.is_some_and(|v| v >= git::version::MINIMUM_GIT_LFS_VERSION);
    println!(
        "[{}] git-lfs: {}",
        if lfs_ok { "OK" } else { "INFO" },
        match lfs_version {
            Some(v) => format!("{}", v),
            None => "not found (only needed for --lfs)".to_string(),
        }
    );

    // Check token
    let token_set = std::env::var("GHCO_TOKEN").is_ok() || std::env::var("GITHUB_TOKEN").is_ok();
    println!(
        "[{}] token: {}",
        if token_set { "OK" } else { "INFO" },
        if token_set {
            "set in the environment"
        } else {
            "not set (anonymous API access is rate limited)"
        }
    );

    Ok(())
}
