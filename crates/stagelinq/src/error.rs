//! Error kinds for the StagelinQ engine.

use thiserror::Error;

/// Errors surfaced by the codec, discovery, and connection layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("truncated stream: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
