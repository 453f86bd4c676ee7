//! Setu Common - shared types and utilities
//!
//! This crate provides the core types used across the setu proxy
//! workspace: the wire address representation, the monotonic clock,
//! the FNV-1a hash used to key sessions and spread return traffic,
//! and the process-wide configuration.

pub mod address;
pub mod config;
pub mod error;
pub mod fnv;
pub mod time;

// Re-export commonly used types
pub use address::Address;
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use fnv::{fnv1a, hash_address, Fnv64};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
