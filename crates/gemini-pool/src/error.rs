//! Error types for pool operations

/// Errors from pool operations.
///
/// `NotFound` and `Duplicate` carry the trailing characters of the refresh
/// token involved, never the full value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential store error: {0}")]
    Store(#[from] gemini_auth::Error),

    #[error("credential not found: ...{0}")]
    NotFound(String),

    #[error("duplicate refresh token: ...{0}")]
    Duplicate(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
