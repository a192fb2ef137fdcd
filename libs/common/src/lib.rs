//! Shared service plumbing
//!
//! - logging bootstrap
//! - common command-line arguments
//! - shutdown signal handling

pub mod bootstrap_args;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use error::{Error, Result};
pub use logging::{LogConfig, LogGuard};
