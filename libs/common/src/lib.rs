//! Shared building blocks for the press-control services
//!
//! Provides functions shared by all services, including:
//! - logging bootstrap with runtime level reload
//! - graceful shutdown signal handling
//! - flexible serde helpers for loosely typed upstream records

pub mod logging;
pub mod serde_helpers;
pub mod shutdown;

// Re-export common dependencies
pub use serde;
pub use tokio;
