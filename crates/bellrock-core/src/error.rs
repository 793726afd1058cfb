//! Error types for Bellrock

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Bellrock error types
#[derive(Debug, Error)]
pub enum Error {
    /// Referenced UID, key, or location is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to register an already-registered UID
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Underlying database IO or constraint failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Cipher setup or operation refused a key or block
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invariant violated at read time
    #[error("integrity error: {0}")]
    Integrity(String),
}
