//! SSH building blocks for the controller side.
//!
//! The handshake, channel, and cipher machinery comes from `russh`; this
//! module owns everything around it that the deployment pipeline depends
//! on:
//!
//! - [`identity`] - classifying and loading the operator's SSH identity
//!   (private key file, encrypted key file, or agent-backed public key)
//! - [`endpoint`] - address/port validation and socket formatting
//! - [`known_hosts`] - the hashed trust store consulted on every handshake
//! - [`authorized_keys`] - the agent-side public key whitelist format
//! - [`transport`] - dial-with-retry plus the exec / sftp / update sessions

pub mod authorized_keys;
pub mod endpoint;
pub mod identity;
pub mod known_hosts;
pub mod transport;

pub use authorized_keys::{AuthorizedKey, AuthorizedKeys};
pub use endpoint::parse_endpoint_address;
pub use identity::{Identity, IdentityAuth};
pub use known_hosts::KnownHostsStore;
pub use transport::Transport;
