//! # Drover Platform
//!
//! Core platform types shared by every Drover crate.
//!
//! This crate provides:
//! - Unified error types (`DroverError`, `DroverResult`)
//! - The operator interaction seam (`Prompter`)
//!
//! # Examples
//!
//! ```
//! use drover_platform::{DroverError, DroverResult};
//!
//! fn example_function() -> DroverResult<String> {
//!     Ok("Hello, Drover!".to_string())
//! }
//!
//! # fn main() -> DroverResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Drover!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod prompt;

pub use error::{DroverError, DroverResult};
pub use prompt::{Prompter, ScriptedPrompter, TerminalPrompter};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
