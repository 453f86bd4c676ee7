//! Error types for the setu proxy
//!
//! One shared error enum for all proxy components. Per-packet failures
//! are not represented here (they are logged and dropped); this covers
//! initialization and configuration paths, which are fatal.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("Accelerator error: {0}")]
    Accelerator(String),
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
