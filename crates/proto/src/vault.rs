//! Encrypted endpoint credential vault.
//!
//! The vault file is a single base64 blob (see [`crate::crypto`]) whose
//! plaintext is a JSON map of endpoint name to credential:
//!
//! ```text
//! { "webserver1": { "LoginUserPassword": "..." } }
//! ```
//!
//! Two entry points touch it:
//!
//! - [`Vault::modify`] - the interactive `vault <host>` flow: create the
//!   file if absent, decrypt when it already has a payload, add / replace /
//!   delete one entry, re-encrypt, rewrite atomically at mode `0600`.
//! - [`Vault::password_for`] - the deployment flow: decrypt lazily, at most
//!   once per process, no matter how many workers are blocked on it.

use crate::crypto;
use drover_platform::{DroverError, DroverResult, Prompter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A vault file whose size is at or below this holds no payload; the
/// decoded salt+nonce header alone is 28 bytes.
pub const EMPTY_VAULT_THRESHOLD: u64 = 28;

/// Credential material stored per endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Password of the login user on the endpoint (fed to `sudo -S`).
    #[serde(rename = "LoginUserPassword")]
    pub login_user_password: String,
}

type VaultMap = HashMap<String, Credential>;

/// Process-wide handle to the encrypted credential store.
pub struct Vault {
    path: PathBuf,
    prompter: Arc<dyn Prompter>,
    /// `None` until the first unlock; read-only afterwards.
    unlocked: tokio::sync::Mutex<Option<VaultMap>>,
}

impl Vault {
    /// Creates a handle without touching the file.
    pub fn new(path: impl Into<PathBuf>, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            path: path.into(),
            prompter,
            unlocked: tokio::sync::Mutex::new(None),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the login password for `endpoint`, decrypting the vault on
    /// first use.
    ///
    /// The decryption prompt happens at most once per process; concurrent
    /// callers serialize on the internal mutex and reuse the unlocked map.
    ///
    /// # Errors
    ///
    /// [`DroverError::NoVaultEntry`] when the vault has no entry for
    /// `endpoint`; [`DroverError::BadCiphertext`] when the operator
    /// password does not open the blob.
    pub async fn password_for(&self, endpoint: &str) -> DroverResult<String> {
        let mut guard = self.unlocked.lock().await;

        if guard.is_none() {
            debug!("reading vault file {}", self.path.display());
            let encoded = std::fs::read(&self.path).map_err(|e| {
                DroverError::Config(format!("failed to retrieve vault file: {}", e))
            })?;

            let vault_password = self.prompter.prompt_secret("Enter password for vault: ")?;

            debug!("decrypting vault");
            let plaintext = crypto::decrypt(&encoded, &vault_password)?;
            *guard = Some(parse_vault(&plaintext)?);
        }

        let map = guard.as_ref().expect("vault unlocked above");
        map.get(endpoint)
            .map(|credential| credential.login_user_password.clone())
            .ok_or_else(|| DroverError::NoVaultEntry(endpoint.to_string()))
    }

    /// Interactive add / replace / delete of one endpoint entry.
    ///
    /// An empty host password offers to delete the entry (confirmed with a
    /// literal `y`); mismatched confirmation passwords abort without
    /// touching the file.
    pub fn modify(&self, endpoint: &str, login_user: &str) -> DroverResult<()> {
        if !self.path.exists() {
            write_vault_file(&self.path, b"")?;
        }

        let vault_password = self.prompter.prompt_secret("Enter password for vault: ")?;

        let file_size = std::fs::metadata(&self.path)?.len();
        let mut map: VaultMap = if file_size > EMPTY_VAULT_THRESHOLD {
            let encoded = std::fs::read(&self.path).map_err(|e| {
                DroverError::Config(format!("failed to retrieve vault file: {}", e))
            })?;
            let plaintext = crypto::decrypt(&encoded, &vault_password)?;
            parse_vault(&plaintext)?
        } else {
            VaultMap::new()
        };

        let host_password = self.prompter.prompt_secret(&format!(
            "Enter '{}' password for host '{}' (leave empty to delete entry): ",
            login_user, endpoint
        ))?;

        if host_password.is_empty() {
            if !map.contains_key(endpoint) {
                return Ok(());
            }

            let answer = self.prompter.prompt_line(&format!(
                "Please type 'y' to delete vault host '{}': ",
                endpoint
            ))?;
            if answer != "y" {
                info!("did not receive confirmation, vault unchanged");
                return Ok(());
            }

            map.remove(endpoint);
            return self.write_locked(&map, &vault_password);
        }

        let confirmation = self.prompter.prompt_secret(&format!(
            "Enter '{}' password for host '{}' again: ",
            login_user, endpoint
        ))?;
        if host_password != confirmation {
            return Err(DroverError::Config("passwords do not match".to_string()));
        }

        map.insert(
            endpoint.to_string(),
            Credential {
                login_user_password: host_password,
            },
        );
        self.write_locked(&map, &vault_password)
    }

    /// Encrypts `map` and rewrites the vault file.
    fn write_locked(&self, map: &VaultMap, vault_password: &str) -> DroverResult<()> {
        let plaintext = serde_json::to_vec(map)
            .map_err(|e| DroverError::Config(format!("failed to serialize vault: {}", e)))?;
        let encoded = crypto::encrypt(&plaintext, vault_password)?;
        write_vault_file(&self.path, &encoded)
    }
}

fn parse_vault(plaintext: &[u8]) -> DroverResult<VaultMap> {
    serde_json::from_slice(plaintext)
        .map_err(|e| DroverError::BadCiphertext(format!("vault payload is not valid JSON: {}", e)))
}

/// Atomic rewrite at mode `0600` (write-temp-then-rename).
fn write_vault_file(path: &Path, contents: &[u8]) -> DroverResult<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}
