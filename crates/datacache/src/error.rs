//! Error kinds for the data cache.

use thiserror::Error;

/// Errors surfaced by storage, the rate limiter, the fetcher, and workers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unsupported request key: {0}")]
    UnsupportedRequestKey(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
