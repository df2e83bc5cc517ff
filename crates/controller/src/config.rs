//! Controller configuration.
//!
//! One YAML file describes the repository, the SSH client defaults, the
//! universal layout, and every managed endpoint:
//!
//! ```yaml
//! Controller:
//!   RepositoryPath: /srv/configs
//! SSHClient:
//!   SSHIdentityFile: /srv/keys/id_ed25519
//!   UseSSHAgent: false
//!   KnownHostsFile: /srv/keys/known_hosts
//!   RemoteTransferBuffer: /tmp/.drover-buffer
//!   MaximumConcurrency: 10
//! UniversalDirectory: UniversalConfs
//! UniversalGroups:
//!   UniversalConfs_Web: [webserver1, webserver2]
//! VaultFilePath: /srv/keys/vault.db
//! DeployerEndpoints:
//!   webserver1:
//!     Endpoint: 10.1.0.10
//!     EndpointPort: 2022
//!     EndpointUser: deploy
//!     PasswordRequired: true
//! ```
//!
//! Per-endpoint values fall back to the `SSHClient` defaults where it makes
//! sense (transfer buffer); everything else is explicit.

use drover_platform::{DroverError, DroverResult};
use drover_proto::ssh::parse_endpoint_address;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level controller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Repository settings.
    #[serde(rename = "Controller")]
    pub controller: ControllerSection,

    /// SSH client defaults shared by all endpoints.
    #[serde(rename = "SSHClient")]
    pub ssh_client: SshClientSection,

    /// Directory whose files apply to every endpoint unless shadowed.
    #[serde(rename = "UniversalDirectory")]
    pub universal_directory: String,

    /// Named universal directories and their member endpoints.
    #[serde(rename = "UniversalGroups", default)]
    pub universal_groups: HashMap<String, Vec<String>>,

    /// Encrypted credential vault location.
    #[serde(rename = "VaultFilePath")]
    pub vault_file_path: PathBuf,

    /// Managed endpoints, keyed by the repository directory that feeds them.
    #[serde(rename = "DeployerEndpoints")]
    pub endpoints: HashMap<String, EndpointConfig>,
}

/// Repository settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSection {
    /// Root of the configuration repository.
    #[serde(rename = "RepositoryPath")]
    pub repository_path: PathBuf,
}

/// SSH client defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SshClientSection {
    /// Identity file (private key, encrypted private key, or public key).
    #[serde(rename = "SSHIdentityFile")]
    pub ssh_identity_file: PathBuf,

    /// Authenticate through the agent at `SSH_AUTH_SOCK`.
    #[serde(rename = "UseSSHAgent", default)]
    pub use_ssh_agent: bool,

    /// Hashed known_hosts trust file.
    #[serde(rename = "KnownHostsFile")]
    pub known_hosts_file: PathBuf,

    /// Default remote transfer buffer path.
    #[serde(rename = "RemoteTransferBuffer")]
    pub remote_transfer_buffer: String,

    /// Parallel endpoint workers.
    #[serde(rename = "MaximumConcurrency")]
    pub maximum_concurrency: usize,
}

/// Whether an endpoint takes part in deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// Deploy normally.
    #[default]
    Online,
    /// Skip entirely; no connection is attempted.
    Offline,
}

/// One managed endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// IP address (v4 or v6).
    #[serde(rename = "Endpoint")]
    pub address: String,

    /// SSH port.
    #[serde(rename = "EndpointPort")]
    pub port: u32,

    /// Login user.
    #[serde(rename = "EndpointUser")]
    pub user: String,

    /// Per-host transfer buffer override.
    #[serde(rename = "RemoteTransferBuffer", default)]
    pub remote_transfer_buffer: Option<String>,

    /// Online/offline switch.
    #[serde(rename = "HostState", default)]
    pub state: HostState,

    /// Skip files from the universal directory for this host.
    #[serde(rename = "IgnoreUniversalConfs", default)]
    pub ignore_universal_confs: bool,

    /// Fetch this host's sudo password from the vault before deploying.
    #[serde(rename = "PasswordRequired", default)]
    pub password_required: bool,
}

/// Endpoint with defaults applied and the dial socket formatted.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    /// Endpoint name (repository directory).
    pub name: String,
    /// `address:port` / `[address]:port` dial string.
    pub socket: String,
    /// Login user.
    pub user: String,
    /// Remote transfer buffer path.
    pub transfer_buffer: String,
    /// Whether the sudo password comes from the vault.
    pub password_required: bool,
}

impl Config {
    /// Loads and validates the YAML configuration.
    pub fn load(path: &Path) -> DroverResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DroverError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| DroverError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations with missing required fields.
    pub fn validate(&self) -> DroverResult<()> {
        let missing = if self.controller.repository_path.as_os_str().is_empty() {
            Some("RepositoryPath")
        } else if self.ssh_client.ssh_identity_file.as_os_str().is_empty() {
            Some("SSHIdentityFile")
        } else if self.ssh_client.known_hosts_file.as_os_str().is_empty() {
            Some("KnownHostsFile")
        } else if self.ssh_client.remote_transfer_buffer.is_empty() {
            Some("RemoteTransferBuffer")
        } else if self.ssh_client.maximum_concurrency == 0 {
            Some("MaximumConcurrency")
        } else if self.universal_directory.is_empty() {
            Some("UniversalDirectory")
        } else if self.vault_file_path.as_os_str().is_empty() {
            Some("VaultFilePath")
        } else {
            None
        };

        if let Some(field) = missing {
            return Err(DroverError::Config(field.to_string()));
        }

        for (group, members) in &self.universal_groups {
            for member in members {
                if !self.endpoints.contains_key(member) {
                    return Err(DroverError::Config(format!(
                        "universal group '{}' references unknown endpoint '{}'",
                        group, member
                    )));
                }
            }
        }

        Ok(())
    }

    /// Whether `name` is the universal directory or a universal group.
    pub fn is_universal(&self, name: &str) -> bool {
        name == self.universal_directory || self.universal_groups.contains_key(name)
    }

    /// Applies SSH client defaults and formats the dial socket for `name`.
    pub fn resolve_endpoint(&self, name: &str) -> DroverResult<ResolvedEndpoint> {
        let endpoint = self.endpoints.get(name).ok_or_else(|| {
            DroverError::Config(format!("unknown endpoint '{}'", name))
        })?;

        let socket = parse_endpoint_address(&endpoint.address, endpoint.port)?;

        Ok(ResolvedEndpoint {
            name: name.to_string(),
            socket,
            user: endpoint.user.clone(),
            transfer_buffer: endpoint
                .remote_transfer_buffer
                .clone()
                .unwrap_or_else(|| self.ssh_client.remote_transfer_buffer.clone()),
            password_required: endpoint.password_required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
Controller:
  RepositoryPath: /srv/configs
SSHClient:
  SSHIdentityFile: /srv/keys/id_ed25519
  UseSSHAgent: false
  KnownHostsFile: /srv/keys/known_hosts
  RemoteTransferBuffer: /tmp/.drover-buffer
  MaximumConcurrency: 10
UniversalDirectory: UniversalConfs
UniversalGroups:
  UniversalConfs_Web: [webserver1]
VaultFilePath: /srv/keys/vault.db
DeployerEndpoints:
  webserver1:
    Endpoint: 10.1.0.10
    EndpointPort: 2022
    EndpointUser: deploy
    PasswordRequired: true
  dbserver1:
    Endpoint: fd00::21
    EndpointPort: 22
    EndpointUser: deploy
    HostState: offline
    RemoteTransferBuffer: /var/tmp/.buffer
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.universal_directory, "UniversalConfs");
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints["dbserver1"].state, HostState::Offline);
        assert!(config.endpoints["webserver1"].password_required);
    }

    #[test]
    fn test_resolve_endpoint_defaults() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();

        let web = config.resolve_endpoint("webserver1").unwrap();
        assert_eq!(web.socket, "10.1.0.10:2022");
        assert_eq!(web.transfer_buffer, "/tmp/.drover-buffer");

        let db = config.resolve_endpoint("dbserver1").unwrap();
        assert_eq!(db.socket, "[fd00::21]:22");
        assert_eq!(db.transfer_buffer, "/var/tmp/.buffer");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.ssh_client.maximum_concurrency = 0;
        let result = config.validate();
        assert!(matches!(result, Err(DroverError::Config(field)) if field == "MaximumConcurrency"));
    }

    #[test]
    fn test_unknown_group_member_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config
            .universal_groups
            .insert("UniversalConfs_Db".to_string(), vec!["ghost".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_universal() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(config.is_universal("UniversalConfs"));
        assert!(config.is_universal("UniversalConfs_Web"));
        assert!(!config.is_universal("webserver1"));
    }
}
