//! Deployer SSH server.
//!
//! A deliberately narrow SSH server: one authorized username, a public key
//! whitelist, session channels only, and exactly three request kinds on an
//! accepted channel:
//!
//! - **exec** - stdin is buffered until EOF, then the command runs with the
//!   first whitespace token as the program; stdout/stderr stream back and a
//!   4-byte big-endian `exit-status` ends the exchange
//! - **subsystem `sftp`** - a filesystem-backed SFTP server for the
//!   transfer buffer
//! - **subsystem `update`** - the first data frame is the length-prefixed
//!   path of the new binary; the updater program is handed that path
//!   through the same exec machinery
//!
//! The server identification embeds the agent version
//! (`SSH-2.0-OpenSSH_<version>`), letting the controller read deployer
//! versions straight out of the handshake. SIGTERM received while a
//! connection is active is deferred until that connection finishes.

use crate::config::Config;
use crate::sftp::SftpHandler;
use drover_platform::{DroverError, DroverResult};
use drover_proto::ssh::authorized_keys::AuthorizedKeys;
use drover_proto::ssh::identity::public_key_base64;
use drover_proto::wire;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, SshId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// Builds the server identification string carrying the agent version.
pub fn server_id() -> String {
    format!("SSH-2.0-OpenSSH_{}", env!("CARGO_PKG_VERSION"))
}

/// Loads everything the server needs to start.
///
/// Shared by the real startup and the dry-run check, so a broken key or
/// whitelist is caught before any socket is bound.
pub fn startup_check(config: &Config) -> DroverResult<(PrivateKey, AuthorizedKeys)> {
    let host_key = russh::keys::load_secret_key(&config.ssh_server.ssh_priv_key_file, None)
        .map_err(|e| DroverError::Config(format!("error loading SSH private key: {}", e)))?;
    let authorized_keys = AuthorizedKeys::from_lines(&config.ssh_server.authorized_keys)?;
    Ok((host_key, authorized_keys))
}

/// Runs the SSH server until SIGTERM.
pub async fn run(config: Config) -> DroverResult<()> {
    let (host_key, authorized_keys) = startup_check(&config)?;
    let socket = config.listen_socket();

    let russh_config = Arc::new(server::Config {
        server_id: SshId::Standard(server_id()),
        keys: vec![host_key],
        ..server::Config::default()
    });

    let active_connections = Arc::new(AtomicUsize::new(0));
    let mut deployer = DeployerServer {
        authorized_user: config.ssh_server.authorized_user.clone(),
        authorized_keys: Arc::new(authorized_keys),
        updater_program: config.updater_program.clone(),
        active_connections: active_connections.clone(),
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(DroverError::Io)?;

    info!("deployer ({}) SSH server started on {}", server_id(), socket);

    tokio::select! {
        result = deployer.run_on_address(russh_config, socket.as_str()) => {
            result.map_err(|e| DroverError::Dial(format!("failed to listen on {}: {}", socket, e)))
        }
        _ = sigterm.recv() => {
            // Let the connection being served finish before going down.
            while active_connections.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("deployer SSH server shut down");
            Ok(())
        }
    }
}

struct DeployerServer {
    authorized_user: String,
    authorized_keys: Arc<AuthorizedKeys>,
    updater_program: String,
    active_connections: Arc<AtomicUsize>,
}

impl server::Server for DeployerServer {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> ClientHandler {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ClientHandler {
            authorized_user: self.authorized_user.clone(),
            authorized_keys: self.authorized_keys.clone(),
            updater_program: self.updater_program.clone(),
            peer,
            channels: HashMap::new(),
            active_connections: self.active_connections.clone(),
        }
    }
}

/// What a channel is waiting to run once stdin is complete.
enum PendingRequest {
    /// Plain remote command.
    Exec(String),
    /// Framed self-update; the payload is the binary's path.
    Update,
}

struct ChannelState {
    /// Present until a subsystem takes the channel over.
    channel: Option<Channel<Msg>>,
    pending: Option<PendingRequest>,
    stdin: Vec<u8>,
}

/// One client connection.
pub struct ClientHandler {
    authorized_user: String,
    authorized_keys: Arc<AuthorizedKeys>,
    updater_program: String,
    peer: Option<SocketAddr>,
    channels: HashMap<ChannelId, ChannelState>,
    active_connections: Arc<AtomicUsize>,
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl server::Handler for ClientHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if user != self.authorized_user {
            warn!("username '{}' is not authorized to log in", user);
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }

        let offered = match public_key_base64(public_key) {
            Ok(encoded) => encoded,
            Err(_) => {
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        };

        if !self.authorized_keys.contains_base64(&offered) {
            warn!("client key is not authorized to log in");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }

        info!(
            "authorized connection from {:?} for user {} authenticated by {} key",
            self.peer,
            user,
            public_key.algorithm()
        );
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            ChannelState {
                channel: Some(channel),
                pending: None,
                stdin: Vec::new(),
            },
        );
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();

        match self.channels.get_mut(&channel_id) {
            Some(state) => {
                state.pending = Some(PendingRequest::Exec(command));
                session.channel_success(channel_id)?;
            }
            None => session.channel_failure(channel_id)?,
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match name {
            wire::SUBSYSTEM_SFTP => {
                let channel = self
                    .channels
                    .get_mut(&channel_id)
                    .and_then(|state| state.channel.take());
                match channel {
                    Some(channel) => {
                        session.channel_success(channel_id)?;
                        tokio::spawn(async move {
                            russh_sftp::server::run(
                                channel.into_stream(),
                                SftpHandler::default(),
                            )
                            .await;
                        });
                    }
                    None => session.channel_failure(channel_id)?,
                }
            }
            wire::SUBSYSTEM_UPDATE => match self.channels.get_mut(&channel_id) {
                Some(state) => {
                    state.pending = Some(PendingRequest::Update);
                    session.channel_success(channel_id)?;
                }
                None => session.channel_failure(channel_id)?,
            },
            other => {
                warn!("received unauthorized subsystem {}", other);
                session.channel_failure(channel_id)?;
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.stdin.extend_from_slice(data);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel_id) else {
            return Ok(());
        };
        let Some(pending) = state.pending.take() else {
            return Ok(());
        };
        let stdin = std::mem::take(&mut state.stdin);

        let outcome = match pending {
            PendingRequest::Exec(command) => execute_command(&command, &stdin).await,
            PendingRequest::Update => match wire::strip_payload_string(&stdin) {
                Ok(source_path) => {
                    info!("received update request, running update program");
                    let command = format!("{} -src {}", self.updater_program, source_path);
                    execute_command(&command, &[]).await
                }
                Err(err) => CommandOutcome {
                    stdout: Vec::new(),
                    stderr: err.to_string().into_bytes(),
                    exit_code: 1,
                },
            },
        };

        if !outcome.stdout.is_empty() {
            session.data(channel_id, CryptoVec::from_slice(&outcome.stdout))?;
        }
        if !outcome.stderr.is_empty() {
            session.extended_data(channel_id, 1, CryptoVec::from_slice(&outcome.stderr))?;
        }
        session.exit_status_request(channel_id, outcome.exit_code)?;
        session.close(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

struct CommandOutcome {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: u32,
}

/// Exit-status policy: 0 on success, 127 when the executable is missing,
/// 126 when it exists but cannot run, otherwise the child's code.
fn spawn_failure_code(err: &std::io::Error) -> u32 {
    match err.kind() {
        std::io::ErrorKind::NotFound => 127,
        _ => 126,
    }
}

/// Runs `command` with the buffered stdin and collects its output.
///
/// The first whitespace-separated token is the program; the rest are its
/// arguments. Stderr is suppressed on success because `sudo -S` writes its
/// password prompt there.
async fn execute_command(command: &str, stdin_payload: &[u8]) -> CommandOutcome {
    let mut tokens = command.split_whitespace();
    let Some(program) = tokens.next() else {
        return CommandOutcome {
            stdout: Vec::new(),
            stderr: b"empty command".to_vec(),
            exit_code: 127,
        };
    };
    let arguments: Vec<&str> = tokens.collect();

    let mut child = match tokio::process::Command::new(program)
        .args(&arguments)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            error!("failed command execution: {}", err);
            return CommandOutcome {
                stdout: Vec::new(),
                stderr: err.to_string().into_bytes(),
                exit_code: spawn_failure_code(&err),
            };
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(stdin_payload).await;
        // Dropping closes the pipe so the child sees EOF.
    }

    match child.wait_with_output().await {
        Ok(output) => {
            let exit_code = output.status.code().unwrap_or(1) as u32;
            CommandOutcome {
                stdout: output.stdout,
                stderr: if exit_code == 0 { Vec::new() } else { output.stderr },
                exit_code,
            }
        }
        Err(err) => CommandOutcome {
            stdout: Vec::new(),
            stderr: err.to_string().into_bytes(),
            exit_code: 126,
        },
    }
}
