//! Google OAuth credentials for the CloudCode gateway
//!
//! Credential records live in an ordered JSON array on disk, keyed by
//! refresh token. This crate owns the record format, the whole-file storage
//! contract ([`CredentialRepo`]) with its atomic JSON-file implementation,
//! and the refresh call against Google's token endpoint. It has no
//! dependency on the rotation pool or the gateway binary and is tested
//! standalone.
//!
//! Credential flow:
//! 1. An operator adds a record (access + refresh token) through the admin
//!    API or by editing the store file.
//! 2. The rotation pool loads all records via [`CredentialRepo::read_all`]
//!    and assigns each an ephemeral session id.
//! 3. When a record nears expiry the pool calls [`token::refresh_token`]
//!    and persists the updated record.
//! 4. Records the vendor rejects are flagged `enable: false` in place; the
//!    file keeps them so an operator can re-enable or remove them.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{
    generate_session_id, now_ms, token_suffix, CredentialFile, CredentialRecord, CredentialRepo,
    EXPIRY_MARGIN_MS,
};
pub use error::{Error, Result};
pub use token::{refresh_token, TokenResponse};
