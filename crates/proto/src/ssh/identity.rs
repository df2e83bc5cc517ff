//! SSH identity loading.
//!
//! The operator points the controller at one identity file. Its kind
//! decides how authentication happens:
//!
//! - **private** - parsed and used as the signer directly
//! - **encrypted** - passphrase prompted, then used as the signer
//! - **public** - only valid together with `use_agent`; the running agent
//!   at `SSH_AUTH_SOCK` must hold the matching private key
//!
//! The identity also pins the host-key algorithm offered to the server, so
//! the handshake never negotiates an algorithm the trust store has no
//! entry for.

use drover_platform::{DroverError, DroverResult, Prompter};
use russh::keys::{PrivateKey, PublicKey};
use std::path::Path;
use std::sync::Arc;

/// How the transport authenticates to an endpoint.
#[derive(Debug, Clone)]
pub enum IdentityAuth {
    /// Sign with a private key loaded from the identity file.
    KeyFile(Arc<PrivateKey>),
    /// Sign through the SSH agent holding the key for this public half.
    Agent {
        /// Public key read from the identity file.
        public: PublicKey,
    },
}

/// A loaded SSH identity plus the host-key algorithm it pins.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Authentication material.
    pub auth: IdentityAuth,
    /// Public-key type string (e.g. `ssh-ed25519`).
    pub key_algo: String,
}

/// Loads and classifies the identity file.
///
/// A file that parses as both public and private key is treated as private
/// unless `use_agent` is set.
///
/// # Errors
///
/// - [`DroverError::UnknownIdentityFormat`] for unclassifiable files, or a
///   public key without `use_agent`
/// - [`DroverError::AgentUnavailable`] when `use_agent` is set but
///   `SSH_AUTH_SOCK` is not
pub fn load_identity(
    path: &Path,
    use_agent: bool,
    prompter: &dyn Prompter,
) -> DroverResult<Identity> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| DroverError::Config(format!("ssh identity file: {}", e)))?;

    let public = PublicKey::from_openssh(contents.trim()).ok();

    if use_agent {
        let public = public.ok_or_else(|| {
            DroverError::UnknownIdentityFormat(
                "identity file is not a public key, cannot use agent without public key"
                    .to_string(),
            )
        })?;

        if std::env::var_os("SSH_AUTH_SOCK").is_none() {
            return Err(DroverError::AgentUnavailable(
                "cannot use agent, 'SSH_AUTH_SOCK' environment variable is not set".to_string(),
            ));
        }

        let key_algo = public.algorithm().to_string();
        return Ok(Identity {
            auth: IdentityAuth::Agent { public },
            key_algo,
        });
    }

    match russh::keys::decode_secret_key(&contents, None) {
        Ok(key) => {
            let key_algo = key.public_key().algorithm().to_string();
            Ok(Identity {
                auth: IdentityAuth::KeyFile(Arc::new(key)),
                key_algo,
            })
        }
        Err(russh::keys::Error::KeyIsEncrypted) => {
            let passphrase = prompter.prompt_secret(&format!(
                "Enter passphrase for the SSH key `{}`: ",
                path.display()
            ))?;
            let key = russh::keys::decode_secret_key(&contents, Some(&passphrase)).map_err(
                |e| {
                    DroverError::UnknownIdentityFormat(format!(
                        "invalid encrypted private key in identity file: {}",
                        e
                    ))
                },
            )?;
            let key_algo = key.public_key().algorithm().to_string();
            Ok(Identity {
                auth: IdentityAuth::KeyFile(Arc::new(key)),
                key_algo,
            })
        }
        Err(_) if public.is_some() => Err(DroverError::UnknownIdentityFormat(
            "identity file holds a public key; enable the agent option to use it".to_string(),
        )),
        Err(e) => Err(DroverError::UnknownIdentityFormat(e.to_string())),
    }
}

/// Base64 key field of a public key, as written in authorized_keys and
/// known_hosts lines.
pub fn public_key_base64(key: &PublicKey) -> DroverResult<String> {
    let openssh = key
        .to_openssh()
        .map_err(|e| DroverError::Protocol(format!("cannot encode public key: {}", e)))?;
    openssh
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| DroverError::Protocol("public key encoding is malformed".to_string()))
}
