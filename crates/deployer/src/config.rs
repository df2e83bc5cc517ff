//! Deployer agent configuration.
//!
//! ```yaml
//! UpdaterProgram: /usr/local/bin/drover-updater
//! SSHServer:
//!   ListenAddress: 0.0.0.0
//!   ListenPort: 2022
//!   SSHPrivKeyFile: /etc/droverd/ssh_host_key
//!   AuthorizedUser: deploy
//!   AuthorizedKeys:
//!     - ssh-ed25519 AAAA... controller@core
//! ```

use drover_platform::{DroverError, DroverResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Agent configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Executable invoked as `<UpdaterProgram> -src <path>` on update
    /// requests.
    #[serde(rename = "UpdaterProgram")]
    pub updater_program: String,

    /// SSH server settings.
    #[serde(rename = "SSHServer")]
    pub ssh_server: SshServerSection,
}

/// SSH server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SshServerSection {
    /// Listen address (v4 or v6).
    #[serde(rename = "ListenAddress")]
    pub listen_address: String,

    /// Listen port.
    #[serde(rename = "ListenPort")]
    pub listen_port: u16,

    /// Host private key file.
    #[serde(rename = "SSHPrivKeyFile")]
    pub ssh_priv_key_file: PathBuf,

    /// The only username allowed to authenticate.
    #[serde(rename = "AuthorizedUser")]
    pub authorized_user: String,

    /// authorized_keys lines whitelisting controller keys.
    #[serde(rename = "AuthorizedKeys")]
    pub authorized_keys: Vec<String>,
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
        let missing = if self.updater_program.is_empty() {
            Some("UpdaterProgram")
        } else if self.ssh_server.listen_address.is_empty() {
            Some("ListenAddress")
        } else if self.ssh_server.listen_port == 0 {
            Some("ListenPort")
        } else if self.ssh_server.ssh_priv_key_file.as_os_str().is_empty() {
            Some("SSHPrivKeyFile")
        } else if self.ssh_server.authorized_user.is_empty() {
            Some("AuthorizedUser")
        } else if self.ssh_server.authorized_keys.is_empty() {
            Some("AuthorizedKeys")
        } else {
            None
        };

        match missing {
            Some(field) => Err(DroverError::Config(field.to_string())),
            None => Ok(()),
        }
    }

    /// Listen socket, with IPv6 addresses bracketed.
    pub fn listen_socket(&self) -> String {
        if self.ssh_server.listen_address.contains(':') {
            format!(
                "[{}]:{}",
                self.ssh_server.listen_address, self.ssh_server.listen_port
            )
        } else {
            format!(
                "{}:{}",
                self.ssh_server.listen_address, self.ssh_server.listen_port
            )
        }
    }
}
