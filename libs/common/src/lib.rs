//! Hub basic library
//!
//! Shared plumbing for hub services:
//! - logging initialisation
//! - layered configuration loading
//! - shutdown signalling
//! - SQLite client

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod config_loader;
pub mod error;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};

// Re-export common dependencies
pub use anyhow;
pub use serde;
pub use tokio;
