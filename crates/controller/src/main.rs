//! drover - Git-driven configuration deployment controller.
//!
//! Watches a configuration repository, computes which files changed
//! between commits, and streams them to the deployer agents running on the
//! managed endpoints. Failed deployments land in a durable tracker that
//! the next run can replay.

use clap::{Parser, Subcommand};
use drover_platform::{DroverError, DroverResult, Prompter, TerminalPrompter};
use drover_proto::ssh::identity::{load_identity, Identity};
use drover_proto::ssh::known_hosts::KnownHostsStore;
use drover_proto::vault::Vault;
use git2::{Oid, Repository};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drover_controller::config::Config;
use drover_controller::deploy::{self, DeployContext};
use drover_controller::failures::FailureTracker;
use drover_controller::{filter, loader, rollback, scanner, updater};

#[derive(Debug, Parser)]
#[command(name = "drover")]
#[command(version, about = "Git-driven configuration deployment controller")]
struct Cli {
    /// Path to the controller configuration
    #[arg(short = 'c', long, default_value = "controller.yaml")]
    config: PathBuf,

    /// Verbosity (0 = warnings, 1 = progress, 2 = debug, 3+ = trace)
    #[arg(short = 'v', long, default_value_t = 1)]
    verbosity: u8,

    /// Limit the operation to these endpoints (comma-separated)
    #[arg(long, value_name = "CSV")]
    hosts: Option<String>,

    /// Limit the operation to these repository files (comma-separated)
    #[arg(long, value_name = "CSV")]
    files: Option<String>,

    /// Collect and print information without opening any connection
    #[arg(long)]
    dry_run: bool,

    /// Invoked from a Git hook: roll the commit back on fatal errors
    #[arg(long)]
    hook: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy changed files from a commit
    Deploy {
        /// Deploy a specific commit instead of HEAD
        #[arg(long, value_name = "HEX")]
        commit: Option<String>,

        /// Deploy every tracked file, changed or not
        #[arg(long)]
        all: bool,

        /// Replay the failures of the previous run
        #[arg(long)]
        use_failtracker: bool,
    },

    /// Create, update, or delete the vault entry for a host
    Vault {
        /// Endpoint name
        host: String,
    },

    /// Push a new deployer executable to the endpoints
    Update {
        /// Path to the new deployer executable
        #[arg(long, value_name = "FILE")]
        src: PathBuf,
    },

    /// Report deployer versions from the SSH handshake
    Versions,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => rollback::fatal("Error in controller configuration", &err, false, None),
    };

    let repo_path = config.controller.repository_path.clone();
    let rollback_requested = cli.hook;

    match run(cli, config).await {
        Ok(failures) if failures > 0 => {
            // The tracker was written; the run itself still counts.
            eprintln!(
                "{}",
                DroverError::PartialDeployment { failures }
            );
            eprintln!("Rerun with `deploy --use-failtracker` to retry the failed files.");
        }
        Ok(_) => {}
        Err(err) => rollback::fatal(
            "Controller error",
            &err,
            rollback_requested,
            Some(&repo_path),
        ),
    }
}

async fn run(cli: Cli, config: Config) -> DroverResult<usize> {
    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter);

    match cli.command {
        Command::Vault { host } => {
            let user = config
                .endpoints
                .get(&host)
                .map(|endpoint| endpoint.user.clone())
                .ok_or_else(|| DroverError::Config(format!("unknown endpoint '{}'", host)))?;
            let vault = Vault::new(&config.vault_file_path, prompter);
            vault.modify(&host, &user)?;
            Ok(0)
        }

        Command::Versions => {
            let report = updater::check_versions(&config, cli.hosts.as_deref()).await?;
            if !report.is_empty() {
                print!("Deployer executable versions:\n{}", report);
            }
            Ok(0)
        }

        Command::Update { src } => {
            let (identity, known_hosts) = open_ssh_material(&config, &prompter)?;
            updater::push_update(
                &config,
                &identity,
                known_hosts,
                &src,
                cli.hosts.as_deref(),
                cli.dry_run,
            )
            .await?;
            Ok(0)
        }

        Command::Deploy {
            commit,
            all,
            use_failtracker,
        } => {
            let (identity, known_hosts) = open_ssh_material(&config, &prompter)?;

            let repo = Repository::open(&config.controller.repository_path)
                .map_err(|e| DroverError::Git(format!("failed to open repository: {}", e)))?;

            let (commit, scan) = if use_failtracker {
                let (commit_id, scan) = FailureTracker::read_last(
                    &config.controller.repository_path,
                    cli.files.as_deref(),
                )?;
                info!("replaying failure tracker for commit {}", commit_id);
                let oid = Oid::from_str(&commit_id)
                    .map_err(|e| DroverError::Git(format!("bad tracker commit id: {}", e)))?;
                let commit = repo
                    .find_commit(oid)
                    .map_err(|e| DroverError::Git(format!("tracker commit not found: {}", e)))?;
                (commit, scan)
            } else {
                let commit = match commit {
                    Some(hex) => {
                        let oid = Oid::from_str(&hex)
                            .map_err(|e| DroverError::Git(format!("bad commit id: {}", e)))?;
                        repo.find_commit(oid)
                            .map_err(|e| DroverError::Git(format!("commit not found: {}", e)))?
                    }
                    None => repo
                        .head()
                        .and_then(|head| head.peel_to_commit())
                        .map_err(|e| DroverError::Git(format!("failed to resolve HEAD: {}", e)))?,
                };

                let tree = commit
                    .tree()
                    .map_err(|e| DroverError::Git(format!("failed retrieving commit tree: {}", e)))?;
                let scan = if all {
                    scanner::scan_tree(&repo, &tree, &config, cli.files.as_deref())?
                } else {
                    scanner::scan_commit(&repo, &commit, &config, cli.files.as_deref())?
                };
                (commit, scan)
            };

            let tree = commit
                .tree()
                .map_err(|e| DroverError::Git(format!("failed retrieving commit tree: {}", e)))?;

            let plan =
                filter::filter_hosts_and_files(&tree, &scan, &config, cli.hosts.as_deref())?;
            if plan.hosts.is_empty() {
                info!("no endpoints have deployable files in this commit");
                return Ok(0);
            }

            let file_info = loader::load_files(&plan.all_files, &repo, &tree)?;
            let commit_hex = commit.id().to_string();
            drop(tree);

            let vault = Vault::new(&config.vault_file_path, prompter);
            let context = Arc::new(DeployContext {
                config,
                identity,
                known_hosts,
                vault,
                tracker: FailureTracker::new(),
                dry_run: cli.dry_run,
            });

            deploy::run(context, plan, file_info, &commit_hex).await
        }
    }
}

/// Loads the SSH identity and opens the known-hosts snapshot.
fn open_ssh_material(
    config: &Config,
    prompter: &Arc<dyn Prompter>,
) -> DroverResult<(Identity, Arc<KnownHostsStore>)> {
    let identity = load_identity(
        &config.ssh_client.ssh_identity_file,
        config.ssh_client.use_ssh_agent,
        prompter.as_ref(),
    )?;
    let known_hosts = Arc::new(KnownHostsStore::open(
        &config.ssh_client.known_hosts_file,
        prompter.clone(),
    )?);
    Ok((identity, known_hosts))
}
