//! Error types for Drover

use std::fmt;

/// Unified error type for all Drover operations
#[derive(Debug)]
pub enum DroverError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error (missing file, missing field, invalid value)
    Config(String),

    /// Git repository access error
    Git(String),

    /// Vault blob could not be decoded or authenticated
    BadCiphertext(String),

    /// The vault holds no credential for the named endpoint
    NoVaultEntry(String),

    /// Identity file is neither a private, encrypted, nor public key
    UnknownIdentityFormat(String),

    /// SSH agent missing, empty, or lacking the requested key
    AgentUnavailable(String),

    /// Remote host key was not accepted
    UntrustedHost(String),

    /// Connection to a remote endpoint failed
    Dial(String),

    /// Remote authentication was rejected
    Auth(String),

    /// Remote command exited abnormally or wrote to stderr
    Exec {
        /// Remote exit code (-1 when the command never reported one)
        exit: i32,
        /// Captured remote stderr
        stderr: String,
    },

    /// File transfer to the remote buffer failed
    Transfer(String),

    /// An operation exceeded its deadline
    Timeout(String),

    /// Per-file metadata header could not be parsed
    MetadataParse(String),

    /// Committed symbolic link could not be resolved inside the repository
    SymlinkResolve(String),

    /// Wire protocol violation (framing, unexpected reply)
    Protocol(String),

    /// The run completed but some hosts or files failed
    PartialDeployment {
        /// Number of failure records written to the tracker
        failures: usize,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl DroverError {
    /// Whether this error must abort the whole run.
    ///
    /// Fatal errors are those detected before the per-host fan-out; anything
    /// a single worker can hit is recorded in the failure tracker instead of
    /// aborting its siblings.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DroverError::Config(_)
                | DroverError::Git(_)
                | DroverError::BadCiphertext(_)
                | DroverError::UnknownIdentityFormat(_)
                | DroverError::MetadataParse(_)
                | DroverError::SymlinkResolve(_)
        )
    }
}

impl fmt::Display for DroverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DroverError::Io(e) => write!(f, "IO error: {}", e),
            DroverError::Config(msg) => write!(f, "Configuration error: {}", msg),
            DroverError::Git(msg) => write!(f, "Git error: {}", msg),
            DroverError::BadCiphertext(msg) => write!(f, "Vault decryption error: {}", msg),
            DroverError::NoVaultEntry(host) => {
                write!(f, "host '{}' does not have an entry in the vault", host)
            }
            DroverError::UnknownIdentityFormat(msg) => {
                write!(f, "unknown identity file format: {}", msg)
            }
            DroverError::AgentUnavailable(msg) => write!(f, "ssh agent: {}", msg),
            DroverError::UntrustedHost(host) => {
                write!(f, "not continuing with connection to {}", host)
            }
            DroverError::Dial(msg) => write!(f, "failed connect to SSH server: {}", msg),
            DroverError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            DroverError::Exec { exit, stderr } => {
                write!(f, "remote command failed (exit {}): {}", exit, stderr)
            }
            DroverError::Transfer(msg) => write!(f, "error with file transfer: {}", msg),
            DroverError::Timeout(msg) => write!(f, "timed out: {}", msg),
            DroverError::MetadataParse(msg) => {
                write!(f, "failed to parse metadata header: {}", msg)
            }
            DroverError::SymlinkResolve(msg) => {
                write!(f, "failed resolving symbolic link: {}", msg)
            }
            DroverError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            DroverError::PartialDeployment { failures } => {
                write!(f, "deployment finished with {} failure(s)", failures)
            }
            DroverError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for DroverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DroverError::Io(e) => Some(e),
            DroverError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DroverError {
    fn from(err: std::io::Error) -> Self {
        DroverError::Io(err)
    }
}

/// Result type for Drover operations
pub type DroverResult<T> = Result<T, DroverError>;
