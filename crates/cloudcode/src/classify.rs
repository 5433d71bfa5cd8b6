//! Classification of upstream failures into rotation decisions.
//!
//! Refresh failures and generation failures steer the credential pool
//! differently: a rejected refresh grant kills the credential, a rejected
//! generation call may just mean the request was too large. The functions
//! here are pure so every branch is table-testable.

/// What a failed upstream call means for the credential that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable refresh failure (5xx, timeout, transport); leave the
    /// credential enabled and move the cursor on.
    TransientRefresh,
    /// The token endpoint rejected the grant; disable the credential.
    AuthFailure,
    /// The account has no companion project and can never serve requests.
    Ineligible,
    /// Context-limit rejection; surface the body verbatim, keep the
    /// credential.
    QuotaExceeded,
    /// The account may not call the generation endpoint; disable it.
    PermissionDenied,
    /// Anything else; surface status and body to the caller.
    Generic,
}

/// Substrings the vendor puts in 403 bodies that mean "request exceeds the
/// model context", not "account revoked".
const CONTEXT_LIMIT_MARKERS: &[&str] = &["The caller does not"];

/// Classify a failed token refresh. `None` means the endpoint never
/// answered (timeout or transport failure).
pub fn classify_refresh(status: Option<u16>) -> ErrorClass {
    match status {
        Some(400) | Some(403) => ErrorClass::AuthFailure,
        _ => ErrorClass::TransientRefresh,
    }
}

/// Classify a failed generation (or model-listing) call.
pub fn classify_generation(status: u16, body: &str) -> ErrorClass {
    if status == 403 {
        if CONTEXT_LIMIT_MARKERS
            .iter()
            .any(|marker| body.contains(marker))
        {
            return ErrorClass::QuotaExceeded;
        }
        return ErrorClass::PermissionDenied;
    }
    ErrorClass::Generic
}
