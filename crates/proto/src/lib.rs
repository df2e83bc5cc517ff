//! Protocol and credential plumbing for Drover.
//!
//! This crate provides everything the controller and the deployer agent
//! share below the deployment pipeline:
//!
//! - **Vault** - password-derived encryption of the endpoint credential map
//! - **Wire** - length-prefixed request payload framing
//! - **SSH** - identity loading, known-hosts trust, authorized-keys parsing,
//!   and the transport sessions (exec / sftp / update) spoken to the agent
//!
//! # Example
//!
//! ```rust
//! use drover_proto::crypto;
//!
//! # fn main() -> drover_platform::DroverResult<()> {
//! let sealed = crypto::encrypt(b"secret payload", "hunter2")?;
//! let opened = crypto::decrypt(&sealed, "hunter2")?;
//! assert_eq!(opened, b"secret payload");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod crypto;
pub mod ssh;
pub mod vault;
pub mod wire;
