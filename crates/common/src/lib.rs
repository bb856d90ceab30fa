//! Shared configuration, error types and IDs for ktable crates.
//!
//! Architecture role:
//! - defines the client configuration passed across layers
//! - provides the common [`KtableError`] / [`Result`] contracts
//! - typed ids for transactions and big-column blobs
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`units`]

pub mod config;
pub mod error;
pub mod ids;
pub mod units;

pub use config::ClientConfig;
pub use error::{KtableError, Result};
pub use ids::*;
pub use units::human_bytes;
