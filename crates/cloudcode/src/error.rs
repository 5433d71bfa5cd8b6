//! Error type for CloudCode API calls

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The endpoint answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The call never completed (connect failure, timeout, broken stream).
    #[error("request failed: {0}")]
    Http(String),

    /// The endpoint answered 2xx with a body we could not decode.
    #[error("unexpected response shape: {0}")]
    Parse(String),
}

impl Error {
    /// Status code, when the upstream answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
