//! Error types for relaymeter

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for relaymeter
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Invalid byte size: {0}")]
    ByteSize(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Result type alias for relaymeter
pub type Result<T> = std::result::Result<T, Error>;
