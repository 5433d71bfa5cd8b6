//! Credential records and their durable store
//!
//! The store is an ordered JSON array of records; array order is rotation
//! order and `refresh_token` is the identity key. All writes replace the
//! whole file via atomic temp-file + rename so a crash mid-write never
//! leaves a half-written store. The rotation pool serializes callers, so
//! the store itself stays a plain synchronous file wrapper.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// How long before nominal expiry a token is already treated as expired,
/// in milliseconds. Refreshing this early keeps a token from dying between
/// acquisition and the upstream call.
pub const EXPIRY_MARGIN_MS: u64 = 300_000;

/// One Google OAuth credential plus its gateway bookkeeping.
///
/// Durable fields use the store's mixed naming (`snake_case` token fields,
/// `projectId` from the vendor). `session_id` is ephemeral: regenerated on
/// every pool reload and never written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Current Bearer token for CloudCode calls.
    pub access_token: String,
    /// Refresh grant; identity key of the record.
    pub refresh_token: String,
    /// Access-token lifetime in seconds, as reported by the token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Unix milliseconds of the last refresh. Together with `expires_in`
    /// this yields the absolute expiry instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// A record is eligible for rotation unless this is exactly `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// CloudCode companion project, discovered lazily on first use.
    #[serde(rename = "projectId", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Account email, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Per-process session id; never persisted.
    #[serde(skip)]
    pub session_id: String,
}

impl CredentialRecord {
    /// Eligibility check: only an explicit `"enable": false` excludes a
    /// record.
    pub fn is_enabled(&self) -> bool {
        self.enable != Some(false)
    }

    /// Whether the access token is inside the refresh margin (or has no
    /// recorded lifetime at all, which counts as expired).
    pub fn is_expired(&self, now_ms: u64) -> bool {
        let (Some(timestamp), Some(expires_in)) = (self.timestamp, self.expires_in) else {
            return true;
        };
        let expires_at = timestamp + expires_in * 1000;
        now_ms >= expires_at.saturating_sub(EXPIRY_MARGIN_MS)
    }

    /// Fold a token-endpoint response into the record, stamping the refresh
    /// time. The refresh token is the record's identity and is left alone;
    /// persistence looks records up by it.
    pub fn apply_refresh(&mut self, response: &TokenResponse, now_ms: u64) {
        self.access_token = response.access_token.clone();
        self.expires_in = Some(response.expires_in);
        self.timestamp = Some(now_ms);
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fresh ephemeral session id for one loaded credential.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Log-safe identification for a token: its last eight characters.
pub fn token_suffix(token: &str) -> String {
    let tail: Vec<char> = token.chars().rev().take(8).collect();
    tail.into_iter().rev().collect()
}

/// Whole-file storage contract for credential records.
///
/// Reads and writes move the entire ordered set; rotation state stays in
/// the pool, which never asks storage for partial updates. Keeping this a
/// trait lets the pool run against an in-memory double in tests.
pub trait CredentialRepo: Send + Sync {
    fn read_all(&self) -> Result<Vec<CredentialRecord>>;
    fn write_all(&self, records: &[CredentialRecord]) -> Result<()>;
}

/// JSON-array file implementation of [`CredentialRepo`].
#[derive(Debug)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    /// Open the store at `path`, creating an empty one (and any missing
    /// parent directories) on first run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;
            }
            write_atomic(&path, b"[]")?;
            debug!(path = %path.display(), "created empty credential store");
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialRepo for CredentialFile {
    fn read_all(&self) -> Result<Vec<CredentialRecord>> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))
    }

    fn write_all(&self, records: &[CredentialRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
        write_atomic(&self.path, json.as_bytes())
    }
}

static TMP_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Write a file atomically: unique temp file in the same directory, 0600
/// permissions (the contents are OAuth tokens), then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(
        ".credentials.tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file = fs::File::create(&tmp_path)
        .map_err(|e| Error::Io(format!("creating temp credential file: {e}")))?;
    file.write_all(bytes)
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;
    file.sync_all()
        .map_err(|e| Error::Io(format!("syncing temp credential file: {e}")))?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;
    Ok(())
}
