//! Controller-side SSH transport.
//!
//! One [`Transport`] is one authenticated connection to a deployer
//! endpoint, multiplexing every session the deployment pipeline needs:
//!
//! - **exec** - run a remote command, optionally under `sudo -S`
//! - **sftp** - write bytes into the remote transfer buffer
//! - **update** - framed deployer self-update request
//!
//! Each session shape carries its own deadline; a deadline firing tears the
//! session down (SIGTERM for exec) and surfaces as an error the caller can
//! record against the file being deployed.

use crate::ssh::identity::{public_key_base64, Identity, IdentityAuth};
use crate::ssh::known_hosts::KnownHostsStore;
use crate::wire;
use drover_platform::{DroverError, DroverResult};
use russh::client::{self, AuthResult};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Preferred, Sig, SshId};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Client identification sent in the handshake.
///
/// Some IPS rules flag uncommon SSH client banners, so the controller
/// advertises a stock OpenSSH one. Must stay byte-identical.
pub const CLIENT_VERSION: &str = "SSH-2.0-OpenSSH_9.8p1";

/// Handshake deadline.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote command deadline.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Whole-transfer deadline for buffer writes.
pub const SFTP_TIMEOUT: Duration = Duration::from_secs(90);

/// Deadline for the server to accept an update request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Only "no route to host" is worth retrying; it clears once the network
/// path settles.
const DIAL_ATTEMPTS: u32 = 3;
const DIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Host-key callback bridging the handshake to the known-hosts store.
///
/// Rejections detected by the store are stashed so the caller sees the
/// precise trust error instead of the generic handshake failure.
struct HostKeyHandler {
    store: Arc<KnownHostsStore>,
    host: String,
    rejection: Arc<Mutex<Option<DroverError>>>,
}

impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let key_type = server_public_key.algorithm().to_string();
        let key_base64 = match public_key_base64(server_public_key) {
            Ok(encoded) => encoded,
            Err(err) => {
                *self.rejection.lock().expect("rejection slot poisoned") = Some(err);
                return Ok(false);
            }
        };

        let store = self.store.clone();
        let host = self.host.clone();
        let verdict =
            tokio::task::block_in_place(move || store.verify(&host, &key_type, &key_base64));

        match verdict {
            Ok(()) => Ok(true),
            Err(err) => {
                *self.rejection.lock().expect("rejection slot poisoned") = Some(err);
                Ok(false)
            }
        }
    }
}

/// One authenticated connection to a deployer endpoint.
pub struct Transport {
    handle: client::Handle<HostKeyHandler>,
    socket: String,
}

impl Transport {
    /// Dials and authenticates, retrying only on "no route to host".
    pub async fn dial(
        socket: &str,
        user: &str,
        identity: &Identity,
        store: Arc<KnownHostsStore>,
    ) -> DroverResult<Self> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(
                "establishing connection to {} ({}/{})",
                socket, attempt, DIAL_ATTEMPTS
            );

            match Self::dial_once(socket, user, identity, store.clone()).await {
                Ok(transport) => return Ok(transport),
                Err(err) => {
                    if attempt >= DIAL_ATTEMPTS || !is_no_route(&err) {
                        return Err(err);
                    }
                    debug!("no route to {} yet, backing off", socket);
                    tokio::time::sleep(DIAL_BACKOFF).await;
                }
            }
        }
    }

    async fn dial_once(
        socket: &str,
        user: &str,
        identity: &Identity,
        store: Arc<KnownHostsStore>,
    ) -> DroverResult<Self> {
        let key_algo = russh::keys::ssh_key::Algorithm::new(&identity.key_algo).map_err(|e| {
            DroverError::Config(format!(
                "unsupported key algorithm '{}': {}",
                identity.key_algo, e
            ))
        })?;

        let config = Arc::new(client::Config {
            client_id: SshId::Standard(CLIENT_VERSION.to_string()),
            preferred: Preferred {
                key: Cow::Owned(vec![key_algo]),
                ..Preferred::default()
            },
            ..client::Config::default()
        });

        let host = socket
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| socket.to_string());
        let rejection = Arc::new(Mutex::new(None));
        let handler = HostKeyHandler {
            store,
            host,
            rejection: rejection.clone(),
        };

        let mut handle =
            match tokio::time::timeout(DIAL_TIMEOUT, client::connect(config, socket, handler))
                .await
            {
                Err(_) => {
                    return Err(DroverError::Timeout(format!(
                        "SSH handshake with {}",
                        socket
                    )))
                }
                Ok(Err(err)) => {
                    if let Some(rejection) =
                        rejection.lock().expect("rejection slot poisoned").take()
                    {
                        return Err(rejection);
                    }
                    return Err(DroverError::Dial(err.to_string()));
                }
                Ok(Ok(handle)) => handle,
            };

        let result = match &identity.auth {
            IdentityAuth::KeyFile(key) => handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), None))
                .await
                .map_err(|e| DroverError::Auth(e.to_string()))?,
            IdentityAuth::Agent { public } => {
                Self::authenticate_with_agent(&mut handle, user, public).await?
            }
        };

        match result {
            AuthResult::Success => Ok(Self {
                handle,
                socket: socket.to_string(),
            }),
            AuthResult::Failure { .. } => {
                Err(DroverError::Auth("server rejected the offered key".to_string()))
            }
        }
    }

    /// Finds the signer matching the identity's public key in the agent and
    /// authenticates through it.
    async fn authenticate_with_agent(
        handle: &mut client::Handle<HostKeyHandler>,
        user: &str,
        public: &PublicKey,
    ) -> DroverResult<AuthResult> {
        let mut agent = AgentClient::connect_env()
            .await
            .map_err(|e| DroverError::AgentUnavailable(e.to_string()))?;

        let agent_keys = agent
            .request_identities()
            .await
            .map_err(|e| DroverError::AgentUnavailable(format!("ssh agent key list: {}", e)))?;
        if agent_keys.is_empty() {
            return Err(DroverError::AgentUnavailable(
                "no keys found in agent (Did you forget something?)".to_string(),
            ));
        }

        let wanted = public_key_base64(public)?;
        let loaded = agent_keys.iter().any(|key| {
            public_key_base64(key)
                .map(|encoded| encoded == wanted)
                .unwrap_or(false)
        });
        if !loaded {
            return Err(DroverError::AgentUnavailable(
                "identity public key is not loaded in the agent".to_string(),
            ));
        }

        handle
            .authenticate_publickey_with(user, public.clone(), None, &mut agent)
            .await
            .map_err(|e| DroverError::Auth(e.to_string()))
    }

    /// Runs a remote command, under `sudo -S` when a password is supplied.
    ///
    /// The sudo password (or nothing) is written to stdin, stdin is closed,
    /// and the session is awaited with [`EXEC_TIMEOUT`]. A non-zero exit or
    /// any remote stderr surfaces as [`DroverError::Exec`].
    pub async fn exec(&self, command: &str, sudo_password: Option<&str>) -> DroverResult<String> {
        let full_command = match sudo_password {
            Some(_) => format!("sudo -S {}", command),
            None => command.to_string(),
        };

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| DroverError::Protocol(format!("failed to create session: {}", e)))?;
        channel
            .exec(true, full_command.as_bytes())
            .await
            .map_err(|e| DroverError::Protocol(format!("failed to start command: {}", e)))?;

        // sudo -S reads the password from stdin; close stdin either way so
        // the remote command sees EOF.
        let password = sudo_password.unwrap_or("");
        channel
            .data(password.as_bytes())
            .await
            .map_err(|e| DroverError::Protocol(format!("failed to write command stdin: {}", e)))?;
        channel
            .eof()
            .await
            .map_err(|e| DroverError::Protocol(format!("failed to close command stdin: {}", e)))?;

        let collected = match tokio::time::timeout(EXEC_TIMEOUT, collect_output(&mut channel)).await
        {
            Ok(collected) => collected,
            Err(_) => {
                let _ = channel.signal(Sig::TERM).await;
                let _ = channel.close().await;
                return Err(DroverError::Timeout(format!(
                    "closed ssh session, command '{}' timed out",
                    full_command
                )));
            }
        };

        let exit = collected.exit_status.map(|code| code as i32).unwrap_or(-1);
        if exit != 0 {
            return Err(DroverError::Exec {
                exit,
                stderr: collected.stderr,
            });
        }

        // The agent clears stderr on success (sudo -S prompts there), so
        // anything left is a real remote complaint.
        if !collected.stderr.trim().is_empty() {
            return Err(DroverError::Exec {
                exit: 0,
                stderr: collected.stderr,
            });
        }

        Ok(collected.stdout)
    }

    /// Writes `content` to `remote_path` over an SFTP session.
    pub async fn write_buffer(&self, content: &[u8], remote_path: &str) -> DroverResult<()> {
        let operation = async {
            let channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| DroverError::Transfer(format!("failed to create sftp session: {}", e)))?;
            channel
                .request_subsystem(true, wire::SUBSYSTEM_SFTP)
                .await
                .map_err(|e| DroverError::Transfer(format!("failed to create sftp session: {}", e)))?;

            let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| DroverError::Transfer(format!("failed to create sftp session: {}", e)))?;

            let mut file = sftp
                .create(remote_path)
                .await
                .map_err(|e| transfer_error(remote_path, e.to_string()))?;
            file.write_all(content)
                .await
                .map_err(|e| transfer_error(remote_path, e.to_string()))?;
            file.shutdown()
                .await
                .map_err(|e| transfer_error(remote_path, e.to_string()))?;

            let _ = sftp.close().await;
            Ok(())
        };

        match tokio::time::timeout(SFTP_TIMEOUT, operation).await {
            Ok(result) => result,
            Err(_) => Err(DroverError::Timeout(
                "closed ssh session, file transfer timed out".to_string(),
            )),
        }
    }

    /// Sends the framed update request and returns the updater's stdout.
    ///
    /// The remote path must already hold the new deployer binary (see
    /// [`Transport::write_buffer`]).
    pub async fn send_update_request(&self, remote_path: &str) -> DroverResult<String> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| DroverError::Protocol(format!("failed to create update session: {}", e)))?;

        match tokio::time::timeout(
            REQUEST_TIMEOUT,
            channel.request_subsystem(true, wire::SUBSYSTEM_UPDATE),
        )
        .await
        {
            Err(_) => {
                return Err(DroverError::Timeout(
                    "server did not respond to the update request".to_string(),
                ))
            }
            Ok(Err(err)) => {
                return Err(DroverError::Protocol(format!(
                    "server did not accept request type '{}': {}",
                    wire::SUBSYSTEM_UPDATE,
                    err
                )))
            }
            Ok(Ok(())) => {}
        }

        let framed = wire::frame_payload(remote_path.as_bytes());
        channel
            .data(&framed[..])
            .await
            .map_err(|e| DroverError::Protocol(format!("failed to send update payload: {}", e)))?;
        channel
            .eof()
            .await
            .map_err(|e| DroverError::Protocol(format!("failed to close update payload: {}", e)))?;

        let collected = tokio::time::timeout(EXEC_TIMEOUT, collect_output(&mut channel))
            .await
            .map_err(|_| DroverError::Timeout("update session".to_string()))?;

        if !collected.stderr.trim().is_empty() {
            return Err(DroverError::Exec {
                exit: collected.exit_status.map(|code| code as i32).unwrap_or(-1),
                stderr: collected.stderr,
            });
        }

        Ok(collected.stdout.trim().to_string())
    }

    /// Reads the server identification line without completing a handshake.
    ///
    /// The deployer embeds its own version in its identification
    /// (`SSH-2.0-OpenSSH_<version>`), so the version sweep never has to run
    /// a remote command. Returns the software portion after `SSH-2.0-`.
    pub async fn probe_server_version(socket: &str) -> DroverResult<String> {
        let mut stream =
            tokio::time::timeout(DIAL_TIMEOUT, tokio::net::TcpStream::connect(socket))
                .await
                .map_err(|_| DroverError::Timeout(format!("connecting to {}", socket)))?
                .map_err(|e| DroverError::Dial(e.to_string()))?;

        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream
                .read_exact(&mut byte)
                .await
                .map_err(|e| DroverError::Dial(e.to_string()))?;
            if byte[0] == b'\n' {
                break;
            }
            buffer.push(byte[0]);
            if buffer.len() > 255 {
                return Err(DroverError::Protocol("version string too long".to_string()));
            }
        }

        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end_matches('\r');
        line.strip_prefix("SSH-2.0-")
            .map(str::to_string)
            .ok_or_else(|| {
                DroverError::Protocol(format!("unexpected server identification '{}'", line))
            })
    }

    /// The socket this transport dialed.
    pub fn socket(&self) -> &str {
        &self.socket
    }

    /// Disconnects cleanly.
    pub async fn close(&self) -> DroverResult<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| DroverError::Protocol(e.to_string()))
    }
}

/// Everything a finished session produced.
struct CollectedOutput {
    stdout: String,
    stderr: String,
    exit_status: Option<u32>,
}

async fn collect_output(channel: &mut russh::Channel<client::Msg>) -> CollectedOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }

    CollectedOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_status,
    }
}

/// Whether a dial error is the recoverable "no route to host" case.
fn is_no_route(err: &DroverError) -> bool {
    err.to_string().to_lowercase().contains("no route to host")
}

/// Wraps transfer failures, with a friendlier message for the common
/// unwritable-buffer case.
fn transfer_error(remote_path: &str, message: String) -> DroverError {
    if message.to_lowercase().contains("permission denied") {
        DroverError::Transfer(format!(
            "unable to write to {} (is it writable by the user?): {}",
            remote_path, message
        ))
    } else {
        DroverError::Transfer(message)
    }
}
