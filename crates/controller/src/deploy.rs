//! Deployment orchestrator.
//!
//! Fans the deployment plan out over a bounded worker pool. Each worker
//! owns one endpoint end-to-end: unlock credentials if needed, dial, walk
//! the file list in order, then run reload commands for the files that were
//! placed. Work inside a worker is strictly sequential; the only shared
//! state is the vault (one-shot unlock), the known-hosts store (append
//! mutex), and the failure tracker (append mutex).
//!
//! A worker never aborts its siblings. Whatever it cannot finish lands in
//! the failure tracker: the whole host at index 0 when the connection never
//! came up, or a single file at index k when placement of file k-1 failed.

use crate::config::{Config, ResolvedEndpoint};
use crate::failures::FailureTracker;
use crate::filter::{DeploymentPlan, HostDeployment};
use crate::loader::CommitFileInfo;
use crate::scanner::Action;
use drover_platform::{DroverError, DroverResult};
use drover_proto::ssh::identity::Identity;
use drover_proto::ssh::known_hosts::KnownHostsStore;
use drover_proto::ssh::transport::Transport;
use drover_proto::vault::Vault;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Everything a deployment run shares across workers.
pub struct DeployContext {
    /// Validated controller configuration.
    pub config: Config,
    /// Loaded SSH identity.
    pub identity: Identity,
    /// Host trust store.
    pub known_hosts: Arc<KnownHostsStore>,
    /// Credential vault (unlocked lazily, at most once).
    pub vault: Vault,
    /// Shared failure log.
    pub tracker: FailureTracker,
    /// Print the plan instead of connecting.
    pub dry_run: bool,
}

/// Runs the deployment plan and writes the failure tracker.
///
/// Returns the number of failures recorded; the caller decides how loudly
/// to report them. The tracker file is removed on a clean run.
pub async fn run(
    ctx: Arc<DeployContext>,
    plan: DeploymentPlan,
    file_info: BTreeMap<String, CommitFileInfo>,
    commit_id: &str,
) -> DroverResult<usize> {
    if ctx.dry_run {
        print_plan(&plan);
        return Ok(0);
    }

    let file_info = Arc::new(file_info);
    let semaphore = Arc::new(Semaphore::new(ctx.config.ssh_client.maximum_concurrency));
    let mut workers = JoinSet::new();

    for host in plan.hosts {
        let ctx = ctx.clone();
        let file_info = file_info.clone();
        let semaphore = semaphore.clone();

        workers.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker semaphore closed");
            deploy_to_host(&ctx, &host, &file_info).await;
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!("deployment worker panicked: {}", err);
        }
    }

    let failures = ctx
        .tracker
        .write(&ctx.config.controller.repository_path, commit_id)?;
    if failures == 0 {
        info!("deployment of commit {} complete", commit_id);
    }
    Ok(failures)
}

/// Per-endpoint pipeline; every failure is recorded, never propagated.
async fn deploy_to_host(
    ctx: &DeployContext,
    host: &HostDeployment,
    file_info: &BTreeMap<String, CommitFileInfo>,
) {
    let endpoint = &host.endpoint;
    info!(
        "endpoint {}: deploying {} file(s)",
        endpoint.name,
        host.files.len()
    );

    let sudo_password = if endpoint.password_required {
        match ctx.vault.password_for(&endpoint.name).await {
            Ok(password) => Some(password),
            Err(err) => {
                ctx.tracker.record(&endpoint.name, &host.files, 0, &err);
                return;
            }
        }
    } else {
        None
    };

    let transport = match Transport::dial(
        &endpoint.socket,
        &endpoint.user,
        &ctx.identity,
        ctx.known_hosts.clone(),
    )
    .await
    {
        Ok(transport) => transport,
        Err(err) => {
            ctx.tracker.record(&endpoint.name, &host.files, 0, &err);
            return;
        }
    };

    let mut placed = vec![false; host.files.len()];

    for (position, path) in host.files.iter().enumerate() {
        let Some(info) = file_info.get(path) else {
            continue;
        };

        match place_file(&transport, endpoint, path, info, sudo_password.as_deref()).await {
            Ok(()) => placed[position] = true,
            Err(err) => {
                ctx.tracker
                    .record(&endpoint.name, &host.files, position + 1, &err);
            }
        }
    }

    // Reloads run only for files that made it onto the host, in the order
    // the files were deployed; one failing reload command stops the rest of
    // that file's list.
    for (position, path) in host.files.iter().enumerate() {
        if !placed[position] {
            continue;
        }
        let Some(info) = file_info.get(path) else {
            continue;
        };
        if !info.reload_required {
            continue;
        }

        for command in &info.reload_commands {
            debug!("endpoint {}: reload '{}'", endpoint.name, command);
            if let Err(err) = transport.exec(command, sudo_password.as_deref()).await {
                ctx.tracker
                    .record(&endpoint.name, &host.files, position + 1, &err);
                break;
            }
        }
    }

    let _ = transport.close().await;
}

/// Applies one file's action on the endpoint.
async fn place_file(
    transport: &Transport,
    endpoint: &ResolvedEndpoint,
    path: &str,
    info: &CommitFileInfo,
    sudo_password: Option<&str>,
) -> DroverResult<()> {
    let target = remote_target_path(path)?;

    match &info.action {
        Action::Delete => {
            match transport.exec(&deletion_command(&target), sudo_password).await {
                Ok(_) => Ok(()),
                // A file that is already gone is a successful delete.
                Err(err) if is_missing_file(&err) => Ok(()),
                Err(err) => Err(err),
            }
        }
        Action::SymlinkCreate { target: link_target } => transport
            .exec(&symlink_command(link_target, &target), sudo_password)
            .await
            .map(|_| ()),
        Action::Create => {
            transport
                .write_buffer(&info.data, &endpoint.transfer_buffer)
                .await?;
            transport
                .exec(
                    &placement_command(info, &endpoint.transfer_buffer, &target),
                    sudo_password,
                )
                .await
                .map(|_| ())
        }
        Action::Unsupported => Ok(()),
    }
}

/// Translates a repository path into the absolute path on the endpoint by
/// dropping the host (or universal) directory.
fn remote_target_path(repo_path: &str) -> DroverResult<String> {
    repo_path
        .split_once('/')
        .filter(|(_, rest)| !rest.is_empty())
        .map(|(_, rest)| format!("/{}", rest))
        .ok_or_else(|| {
            DroverError::Protocol(format!(
                "repository path '{}' has no endpoint prefix",
                repo_path
            ))
        })
}

fn deletion_command(target: &str) -> String {
    format!("rm -- {}", target)
}

fn symlink_command(link_target: &str, target: &str) -> String {
    format!("ln -sf -- {} {}", link_target, target)
}

/// Moves the transferred buffer into place with ownership and mode applied
/// atomically.
fn placement_command(info: &CommitFileInfo, buffer: &str, target: &str) -> String {
    let (owner, group) = info
        .owner_group
        .split_once(':')
        .unwrap_or((info.owner_group.as_str(), info.owner_group.as_str()));
    format!(
        "install -o {} -g {} -m {} {} {}",
        owner, group, info.permissions, buffer, target
    )
}

/// Whether an exec failure is the tolerable missing-file case.
fn is_missing_file(err: &DroverError) -> bool {
    match err {
        DroverError::Exec { stderr, .. } => stderr.contains("No such file or directory"),
        _ => false,
    }
}

fn print_plan(plan: &DeploymentPlan) {
    println!("Requested dry-run, aborting connections - information collected for deployment:");
    for host in &plan.hosts {
        println!("Host: {}", host.endpoint.name);
        println!("  Options:");
        println!("       Endpoint Address: {}", host.endpoint.socket);
        println!("       SSH User:         {}", host.endpoint.user);
        println!("       Transfer Buffer:  {}", host.endpoint.transfer_buffer);
        println!("  Files:");
        for file in &host.files {
            println!("       {}", file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_info() -> CommitFileInfo {
        CommitFileInfo {
            action: Action::Create,
            owner_group: "root:wheel".to_string(),
            permissions: 644,
            reload_required: false,
            reload_commands: Vec::new(),
            hash: String::new(),
            data: Vec::new(),
        }
    }

    #[test]
    fn test_remote_target_path_strips_endpoint_prefix() {
        assert_eq!(
            remote_target_path("hostA/etc/ssh/sshd_config").unwrap(),
            "/etc/ssh/sshd_config"
        );
        assert_eq!(
            remote_target_path("UniversalConfs/etc/motd").unwrap(),
            "/etc/motd"
        );
        assert!(remote_target_path("hostA").is_err());
        assert!(remote_target_path("hostA/").is_err());
    }

    #[test]
    fn test_placement_command_uses_metadata() {
        let command = placement_command(&create_info(), "/tmp/.buffer", "/etc/app.conf");
        assert_eq!(
            command,
            "install -o root -g wheel -m 644 /tmp/.buffer /etc/app.conf"
        );
    }

    #[test]
    fn test_placement_command_owner_without_group() {
        let mut info = create_info();
        info.owner_group = "deploy".to_string();
        let command = placement_command(&info, "/tmp/.buffer", "/etc/app.conf");
        assert_eq!(
            command,
            "install -o deploy -g deploy -m 644 /tmp/.buffer /etc/app.conf"
        );
    }

    #[test]
    fn test_missing_file_detection() {
        let missing = DroverError::Exec {
            exit: 1,
            stderr: "rm: cannot remove '/etc/app.conf': No such file or directory".to_string(),
        };
        assert!(is_missing_file(&missing));

        let denied = DroverError::Exec {
            exit: 1,
            stderr: "rm: cannot remove '/etc/app.conf': Permission denied".to_string(),
        };
        assert!(!is_missing_file(&denied));

        assert!(!is_missing_file(&DroverError::Timeout("exec".to_string())));
    }

    #[test]
    fn test_command_shapes() {
        assert_eq!(deletion_command("/etc/app.conf"), "rm -- /etc/app.conf");
        assert_eq!(
            symlink_command("/etc/real.conf", "/etc/link.conf"),
            "ln -sf -- /etc/real.conf /etc/link.conf"
        );
    }
}
