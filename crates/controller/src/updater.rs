//! Deployer fleet management: binary updates and version sweeps.
//!
//! Updates push the new executable into each endpoint's transfer buffer
//! and send the framed update request; the agent hands the path to its
//! updater program. Version sweeps never run a remote command at all - the
//! agent embeds its version in the SSH server identification, which is
//! readable before any authentication.

use crate::config::Config;
use drover_platform::{DroverError, DroverResult};
use drover_proto::ssh::identity::Identity;
use drover_proto::ssh::known_hosts::KnownHostsStore;
use drover_proto::ssh::transport::Transport;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Confirmation line the remote updater prints on success.
const UPDATE_SUCCESS: &str = "Deployer update successful";

/// Prefix the agent wraps its version in.
const SERVER_VERSION_PREFIX: &str = "OpenSSH_";

/// Pushes `update_file` to every selected endpoint and triggers the update.
///
/// Bails on the first failing endpoint; half a fleet on a new version is
/// easier to reason about than interleaved retries.
pub async fn push_update(
    config: &Config,
    identity: &Identity,
    known_hosts: Arc<KnownHostsStore>,
    update_file: &Path,
    host_override: Option<&str>,
    dry_run: bool,
) -> DroverResult<()> {
    let binary = std::fs::read(update_file)
        .map_err(|e| DroverError::Config(format!("failed loading deployer executable: {}", e)))?;

    println!(
        "Pushing deployer update using executable at {}",
        update_file.display()
    );

    for name in selected_endpoints(config, host_override) {
        let endpoint = config.resolve_endpoint(&name)?;

        if dry_run {
            println!("Host: {}", name);
            println!("       Endpoint Address: {}", endpoint.socket);
            println!("       SSH User:         {}", endpoint.user);
            println!("       Transfer Buffer:  {}", endpoint.transfer_buffer);
            continue;
        }

        let result = async {
            let transport = Transport::dial(
                &endpoint.socket,
                &endpoint.user,
                identity,
                known_hosts.clone(),
            )
            .await?;
            transport
                .write_buffer(&binary, &endpoint.transfer_buffer)
                .await?;
            let stdout = transport
                .send_update_request(&endpoint.transfer_buffer)
                .await?;
            let _ = transport.close().await;
            Ok::<String, DroverError>(stdout)
        }
        .await;

        match result {
            Ok(stdout) if stdout == UPDATE_SUCCESS => println!("Updated {}", name),
            Ok(_) => println!("Update pushed to {} (did not receive confirmation)", name),
            Err(err) => {
                return Err(DroverError::Other(
                    format!("host '{}': {}", name, err).into(),
                ))
            }
        }
    }

    Ok(())
}

/// Collects `name:version` lines for every selected endpoint.
pub async fn check_versions(
    config: &Config,
    host_override: Option<&str>,
) -> DroverResult<String> {
    let mut report = String::new();

    for name in selected_endpoints(config, host_override) {
        let endpoint = config.resolve_endpoint(&name)?;
        info!("probing deployer version on {}", endpoint.socket);

        let software = Transport::probe_server_version(&endpoint.socket)
            .await
            .map_err(|err| DroverError::Other(format!("host '{}': {}", name, err).into()))?;
        let version = software
            .strip_prefix(SERVER_VERSION_PREFIX)
            .unwrap_or(&software);

        report.push_str(&format!("{}:{}\n", name, version));
    }

    Ok(report)
}

/// Endpoint names surviving the `--hosts` override, in stable order.
fn selected_endpoints(config: &Config, host_override: Option<&str>) -> Vec<String> {
    let mut names: Vec<String> = config
        .endpoints
        .keys()
        .filter(|name| crate::scanner::override_allows(host_override, name))
        .cloned()
        .collect();
    names.sort();
    names
}
