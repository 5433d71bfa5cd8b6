//! Credential pool for Google OAuth accounts
//!
//! Manages multiple Google accounts with ordered round-robin rotation, lazy
//! token refresh, entitlement checks, and a persisted per-credential model
//! quota cache. The pool reads credentials from a `CredentialRepo` store
//! (single source of truth); disabled records stay on disk so an operator
//! can re-enable them later.
//!
//! Credential lifecycle:
//! 1. Operator adds an account via the admin API → stored, pool reloaded
//! 2. `acquire` returns the record at the cursor, refreshing it first when
//!    it is inside the five-minute expiry margin
//! 3. Token endpoint rejects the refresh grant with 400/403 → record
//!    disabled, the walk continues in place
//! 4. `loadCodeAssist` reports no companion project → record disabled
//! 5. Generation answers a plain 403 → the gateway disables the record
//! 6. Reload (startup or admin) rebuilds the pool from the store

pub mod error;
pub mod quota;
pub mod rotator;

pub use error::{Error, Result};
pub use quota::{
    quotas_from_models, spawn_quota_sweep, ModelQuota, QuotaCache, QuotaRecord, SWEEP_INTERVAL,
};
pub use rotator::{CredentialPatch, CredentialSummary, Rotator, RotatorOptions};
