//! Round-robin credential rotation
//!
//! Maintains an ordered in-memory pool of enabled credentials plus a cursor.
//! `acquire` walks the pool starting at the cursor and visits at most
//! pool-size candidates: each one is refreshed lazily when it is inside the
//! expiry margin and granted a companion project on first use. Candidates
//! the vendor rejects outright are disabled in place and the walk continues;
//! transient failures just advance the cursor. The backing store keeps
//! disabled records so an operator can re-enable them later.

use std::sync::Arc;

use cloudcode::{classify_refresh, CloudCodeClient, ErrorClass};
use gemini_auth::{
    generate_session_id, now_ms, token_suffix, CredentialRecord, CredentialRepo, TOKEN_ENDPOINT,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// `expires_in` assumed for records added without one (seconds).
const DEFAULT_EXPIRES_IN: u64 = 3599;

/// Rotation behavior knobs.
#[derive(Debug, Clone)]
pub struct RotatorOptions {
    /// OAuth token endpoint. Tests point this at a local mock.
    pub token_url: String,
    /// Skip the `loadCodeAssist` entitlement probe and synthesize a project
    /// id locally.
    pub skip_eligibility_check: bool,
}

impl Default for RotatorOptions {
    fn default() -> Self {
        Self {
            token_url: TOKEN_ENDPOINT.to_string(),
            skip_eligibility_check: false,
        }
    }
}

/// Pool order and cursor live under one lock so a full `acquire` walk,
/// including its refresh and entitlement calls, runs without interleaving.
#[derive(Debug, Default)]
struct PoolState {
    pool: Vec<CredentialRecord>,
    cursor: usize,
}

/// Partial update for a stored record. The refresh token is the record's
/// identity and cannot be patched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialPatch {
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
    pub timestamp: Option<u64>,
    pub enable: Option<bool>,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    pub email: Option<String>,
}

/// Store listing entry for the admin API. The refresh token is the lookup
/// key for the other admin routes; the access token is reduced to its
/// trailing characters.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub refresh_token: String,
    pub access_token_suffix: String,
    pub expires_in: Option<u64>,
    pub timestamp: Option<u64>,
    pub enable: bool,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    pub email: Option<String>,
}

/// Round-robin rotation over the credential store.
pub struct Rotator {
    repo: Arc<dyn CredentialRepo>,
    http: reqwest::Client,
    api: CloudCodeClient,
    options: RotatorOptions,
    state: Mutex<PoolState>,
}

impl Rotator {
    /// Create a rotator with an empty pool; call [`Rotator::reload`] to
    /// populate it from the store.
    pub fn new(
        repo: Arc<dyn CredentialRepo>,
        http: reqwest::Client,
        api: CloudCodeClient,
        options: RotatorOptions,
    ) -> Self {
        Self {
            repo,
            http,
            api,
            options,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Rebuild the pool from the store: enabled records only, in store
    /// order, each with a fresh session id. Resets the cursor. Returns the
    /// new pool size.
    pub async fn reload(&self) -> Result<usize> {
        let records = self.repo.read_all()?;
        let mut pool: Vec<CredentialRecord> = records
            .into_iter()
            .filter(CredentialRecord::is_enabled)
            .collect();
        for record in &mut pool {
            record.session_id = generate_session_id();
        }
        let size = pool.len();

        let mut state = self.state.lock().await;
        state.pool = pool;
        state.cursor = 0;
        drop(state);

        if size == 0 {
            warn!("credential pool is empty; add accounts via the admin API");
        } else {
            info!(accounts = size, "credential pool loaded");
        }
        Ok(size)
    }

    /// Hand out the next usable credential, or `None` when the walk
    /// exhausts the pool.
    ///
    /// The walk visits at most as many candidates as the pool held on
    /// entry. Each candidate is refreshed when inside the expiry margin and
    /// granted a companion project if it has none yet. A candidate whose
    /// refresh grant is rejected, or that has no companion project, is
    /// disabled and the walk continues; transient failures advance the
    /// cursor past the candidate. On success the cursor moves one past the
    /// returned record.
    pub async fn acquire(&self) -> Option<CredentialRecord> {
        let mut state = self.state.lock().await;
        let attempts = state.pool.len();

        for _ in 0..attempts {
            if state.pool.is_empty() {
                break;
            }
            let idx = state.cursor;

            if state.pool[idx].is_expired(now_ms()) {
                match gemini_auth::refresh_token(
                    &self.http,
                    &self.options.token_url,
                    &state.pool[idx].refresh_token,
                )
                .await
                {
                    Ok(response) => {
                        state.pool[idx].apply_refresh(&response, now_ms());
                        info!(
                            token = %token_suffix(&state.pool[idx].access_token),
                            "access token refreshed"
                        );
                        self.persist_record(&state.pool[idx]);
                    }
                    Err(e) => match classify_refresh(e.status()) {
                        ErrorClass::AuthFailure => {
                            warn!(
                                token = %token_suffix(&state.pool[idx].access_token),
                                error = %e,
                                "refresh grant rejected, disabling credential"
                            );
                            self.disable_at(&mut state, idx, "auth_failure");
                            continue;
                        }
                        _ => {
                            error!(
                                token = %token_suffix(&state.pool[idx].access_token),
                                error = %e,
                                "token refresh failed, trying next credential"
                            );
                            state.cursor = (idx + 1) % state.pool.len();
                            continue;
                        }
                    },
                }
            }

            if state.pool[idx].project_id.is_none() {
                if self.options.skip_eligibility_check {
                    let project_id = generate_project_id();
                    info!(
                        token = %token_suffix(&state.pool[idx].access_token),
                        project_id = %project_id,
                        "assigned locally generated project id"
                    );
                    state.pool[idx].project_id = Some(project_id);
                    self.persist_record(&state.pool[idx]);
                } else {
                    match self
                        .api
                        .fetch_project_id(&state.pool[idx].access_token)
                        .await
                    {
                        Ok(Some(project_id)) => {
                            info!(
                                token = %token_suffix(&state.pool[idx].access_token),
                                project_id = %project_id,
                                "companion project resolved"
                            );
                            state.pool[idx].project_id = Some(project_id);
                            self.persist_record(&state.pool[idx]);
                        }
                        Ok(None) => {
                            warn!(
                                token = %token_suffix(&state.pool[idx].access_token),
                                "account has no companion project, disabling credential"
                            );
                            self.disable_at(&mut state, idx, "ineligible");
                            continue;
                        }
                        Err(e) => {
                            error!(
                                token = %token_suffix(&state.pool[idx].access_token),
                                error = %e,
                                "companion project lookup failed, trying next credential"
                            );
                            state.cursor = (idx + 1) % state.pool.len();
                            continue;
                        }
                    }
                }
            }

            state.cursor = (idx + 1) % state.pool.len();
            metrics::counter!("pool_acquire_total", "outcome" => "hit").increment(1);
            return Some(state.pool[idx].clone());
        }

        metrics::counter!("pool_acquire_total", "outcome" => "exhausted").increment(1);
        None
    }

    /// Disable a credential by identity, e.g. after the generation endpoint
    /// answers a plain 403. No-op when the record is not in the live pool
    /// (already disabled or removed).
    pub async fn disable(&self, refresh_token: &str) {
        let mut state = self.state.lock().await;
        if let Some(idx) = state
            .pool
            .iter()
            .position(|r| r.refresh_token == refresh_token)
        {
            self.disable_at(&mut state, idx, "permission_denied");
        }
    }

    /// Append a record to the store and reload the pool.
    ///
    /// Records are keyed by refresh token; a second record with the same
    /// key would shadow the first in every lookup, so duplicates are
    /// rejected. Missing `expires_in`, `timestamp` and `enable` fields get
    /// served defaults.
    pub async fn add(&self, mut record: CredentialRecord) -> Result<()> {
        let mut records = self.repo.read_all()?;
        if records
            .iter()
            .any(|r| r.refresh_token == record.refresh_token)
        {
            return Err(Error::Duplicate(token_suffix(&record.refresh_token)));
        }
        record.expires_in = record.expires_in.or(Some(DEFAULT_EXPIRES_IN));
        record.timestamp = record.timestamp.or_else(|| Some(now_ms()));
        record.enable = record.enable.or(Some(true));
        record.session_id = String::new();
        records.push(record);
        self.repo.write_all(&records)?;

        info!(accounts = records.len(), "credential added");
        self.reload().await?;
        Ok(())
    }

    /// Patch a stored record's non-identity fields and reload the pool.
    pub async fn update(&self, refresh_token: &str, patch: CredentialPatch) -> Result<()> {
        let mut records = self.repo.read_all()?;
        let record = records
            .iter_mut()
            .find(|r| r.refresh_token == refresh_token)
            .ok_or_else(|| Error::NotFound(token_suffix(refresh_token)))?;

        if let Some(access_token) = patch.access_token {
            record.access_token = access_token;
        }
        if let Some(expires_in) = patch.expires_in {
            record.expires_in = Some(expires_in);
        }
        if let Some(timestamp) = patch.timestamp {
            record.timestamp = Some(timestamp);
        }
        if let Some(enable) = patch.enable {
            record.enable = Some(enable);
        }
        if let Some(project_id) = patch.project_id {
            record.project_id = Some(project_id);
        }
        if let Some(email) = patch.email {
            record.email = Some(email);
        }
        self.repo.write_all(&records)?;

        info!(token = %token_suffix(refresh_token), "credential updated");
        self.reload().await?;
        Ok(())
    }

    /// Remove a record from the store and reload the pool.
    pub async fn delete(&self, refresh_token: &str) -> Result<()> {
        let mut records = self.repo.read_all()?;
        let before = records.len();
        records.retain(|r| r.refresh_token != refresh_token);
        if records.len() == before {
            return Err(Error::NotFound(token_suffix(refresh_token)));
        }
        self.repo.write_all(&records)?;

        info!(token = %token_suffix(refresh_token), "credential deleted");
        self.reload().await?;
        Ok(())
    }

    /// Sanitized store listing for the admin API, disabled records included.
    pub async fn list(&self) -> Result<Vec<CredentialSummary>> {
        let records = self.repo.read_all()?;
        Ok(records
            .iter()
            .map(|r| CredentialSummary {
                refresh_token: r.refresh_token.clone(),
                access_token_suffix: format!("...{}", token_suffix(&r.access_token)),
                expires_in: r.expires_in,
                timestamp: r.timestamp,
                enable: r.is_enabled(),
                project_id: r.project_id.clone(),
                email: r.email.clone(),
            })
            .collect())
    }

    /// Look up a stored record by identity, refreshing it first when it is
    /// inside the expiry margin. Serves the admin quota view, which needs a
    /// live access token without consuming a rotation turn.
    pub async fn refresh_credential(&self, refresh_token: &str) -> Result<CredentialRecord> {
        let records = self.repo.read_all()?;
        let mut record = records
            .into_iter()
            .find(|r| r.refresh_token == refresh_token)
            .ok_or_else(|| Error::NotFound(token_suffix(refresh_token)))?;

        if record.is_expired(now_ms()) {
            let response =
                gemini_auth::refresh_token(&self.http, &self.options.token_url, refresh_token)
                    .await
                    .map_err(|e| Error::Refresh(e.to_string()))?;
            record.apply_refresh(&response, now_ms());
            info!(
                token = %token_suffix(&record.access_token),
                "access token refreshed for quota lookup"
            );
            self.persist_record(&record);
        }
        Ok(record)
    }

    /// Pool health summary.
    ///
    /// `healthy`: every stored record is in rotation. `degraded`: the
    /// pool is serving but some records are disabled. `unhealthy`: the
    /// pool is empty.
    pub async fn health(&self) -> serde_json::Value {
        let in_rotation = self.state.lock().await.pool.len();

        let (total, accounts) = match self.repo.read_all() {
            Ok(records) => {
                let accounts: Vec<serde_json::Value> = records
                    .iter()
                    .map(|r| {
                        let label = r
                            .email
                            .clone()
                            .unwrap_or_else(|| format!("...{}", token_suffix(&r.access_token)));
                        serde_json::json!({
                            "account": label,
                            "status": if r.is_enabled() { "enabled" } else { "disabled" },
                            "project": r.project_id,
                        })
                    })
                    .collect();
                (records.len(), accounts)
            }
            Err(e) => {
                error!(error = %e, "failed to read credential store for health report");
                (in_rotation, Vec::new())
            }
        };

        let status = if total > 0 && in_rotation == total {
            "healthy"
        } else if in_rotation > 0 {
            "degraded"
        } else {
            "unhealthy"
        };
        serde_json::json!({
            "status": status,
            "accounts_total": total,
            "accounts_in_rotation": in_rotation,
            "accounts_disabled": total.saturating_sub(in_rotation),
            "accounts": accounts,
        })
    }

    /// Flag the record at `idx` disabled, sync the store, drop it from the
    /// pool and clamp the cursor.
    fn disable_at(&self, state: &mut PoolState, idx: usize, reason: &'static str) {
        state.pool[idx].enable = Some(false);
        warn!(
            token = %token_suffix(&state.pool[idx].access_token),
            reason,
            "credential disabled"
        );
        metrics::counter!("pool_credentials_disabled_total", "reason" => reason).increment(1);
        self.persist_pool(state);
        state.pool.remove(idx);
        state.cursor %= state.pool.len().max(1);
    }

    /// Best-effort persist of one record. Store failures are logged; the
    /// in-memory pool stays authoritative.
    fn persist_record(&self, record: &CredentialRecord) {
        if let Err(e) = self.merge_into_store(std::slice::from_ref(record)) {
            error!(error = %e, "failed to persist credential update");
        }
    }

    /// Best-effort persist of every pool record. Used by disable so the
    /// flag lands on disk.
    fn persist_pool(&self, state: &PoolState) {
        if let Err(e) = self.merge_into_store(&state.pool) {
            error!(error = %e, "failed to persist credential pool");
        }
    }

    /// Merge live copies into the stored records by refresh token and
    /// rewrite the store. Records only on disk are left as they are.
    fn merge_into_store(&self, live: &[CredentialRecord]) -> Result<()> {
        let mut records = self.repo.read_all()?;
        for update in live {
            if let Some(slot) = records
                .iter_mut()
                .find(|r| r.refresh_token == update.refresh_token)
            {
                *slot = update.clone();
            }
        }
        self.repo.write_all(&records)?;
        Ok(())
    }
}

/// Synthesize a project id for deployments that skip the entitlement probe.
fn generate_project_id() -> String {
    format!("gen-lang-client-{:010}", rand::random::<u32>())
}
