//! Per-credential model-quota cache
//!
//! Quota snapshots come from the vendor's model listing and age out in two
//! stages: reads stop returning an entry five minutes after its snapshot,
//! and an hourly sweep drops entries older than an hour. Every change
//! rewrites the whole cache file, so a restart resumes with the newest
//! snapshots instead of an empty cache.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use cloudcode::wire::ModelsReply;
use gemini_auth::now_ms;

/// Reads younger than this are served from cache (milliseconds).
pub const CACHE_TTL_MS: u64 = 5 * 60 * 1000;
/// The sweep removes entries older than this (milliseconds).
pub const RETENTION_MS: u64 = 60 * 60 * 1000;
/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// One model's quota, as reported by the vendor. Stored under the short
/// keys of the durable cache format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelQuota {
    /// Remaining fraction of the quota window, `0.0..=1.0`.
    #[serde(rename = "r")]
    pub remaining: Option<f64>,
    /// When the quota window resets, in the vendor's timestamp format.
    #[serde(rename = "t")]
    pub reset_time: Option<String>,
}

/// Cached snapshot for one credential: per-model quotas plus the snapshot
/// time that drives both aging stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    /// Unix milliseconds of the snapshot.
    pub last_updated: u64,
    pub models: HashMap<String, ModelQuota>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuotaFile {
    #[serde(default)]
    meta: QuotaMeta,
    #[serde(default)]
    quotas: HashMap<String, QuotaRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaMeta {
    last_cleanup: u64,
    ttl: u64,
}

impl Default for QuotaMeta {
    fn default() -> Self {
        Self {
            last_cleanup: 0,
            ttl: RETENTION_MS,
        }
    }
}

/// TTL cache of quota snapshots, keyed by the credential's refresh token.
pub struct QuotaCache {
    path: PathBuf,
    state: Mutex<HashMap<String, QuotaRecord>>,
}

impl QuotaCache {
    /// Open the cache at `path`, creating an empty file (and any missing
    /// parent directories) on first run. An unreadable file logs an error
    /// and starts the cache empty; the next update overwrites it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                error!(error = %e, "failed to create quota cache directory");
            }
            let cache = Self {
                path,
                state: Mutex::new(HashMap::new()),
            };
            cache.persist_now(&HashMap::new());
            return cache;
        }

        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<QuotaFile>(&raw) {
                Ok(file) => {
                    debug!(entries = file.quotas.len(), "quota cache loaded");
                    file.quotas
                }
                Err(e) => {
                    error!(error = %e, "quota cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(e) => {
                error!(error = %e, "failed to read quota cache, starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            state: Mutex::new(entries),
        }
    }

    /// Record a fresh snapshot for a credential and rewrite the cache file.
    /// Returns the stored record.
    pub async fn update(
        &self,
        refresh_token: &str,
        models: HashMap<String, ModelQuota>,
    ) -> QuotaRecord {
        let record = QuotaRecord {
            last_updated: now_ms(),
            models,
        };
        let mut entries = self.state.lock().await;
        entries.insert(refresh_token.to_string(), record.clone());
        self.persist_now(&entries);
        record
    }

    /// Snapshot for a credential, unless it is older than the read TTL.
    /// Stale entries stay cached until the sweep removes them.
    pub async fn get(&self, refresh_token: &str) -> Option<QuotaRecord> {
        let entries = self.state.lock().await;
        let record = entries.get(refresh_token)?;
        if now_ms().saturating_sub(record.last_updated) > CACHE_TTL_MS {
            return None;
        }
        Some(record.clone())
    }

    /// Drop entries older than the retention window. The file is rewritten
    /// only when something was removed. Returns the removal count.
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.state.lock().await;
        let now = now_ms();
        let before = entries.len();
        entries.retain(|_, record| now.saturating_sub(record.last_updated) <= RETENTION_MS);
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "swept expired quota records");
            self.persist_now(&entries);
        }
        removed
    }

    /// Number of cached entries, stale ones included.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }

    /// Whole-file rewrite; failures are logged and the in-memory cache
    /// stays authoritative.
    fn persist_now(&self, entries: &HashMap<String, QuotaRecord>) {
        let file = QuotaFile {
            meta: QuotaMeta {
                last_cleanup: now_ms(),
                ttl: RETENTION_MS,
            },
            quotas: entries.clone(),
        };
        if let Err(e) = write_quota_file(&self.path, &file) {
            error!(error = %e, "failed to persist quota cache");
        }
    }
}

/// Atomic write: temp file in the same directory, 0600 (the keys are
/// refresh tokens), then rename over the target.
fn write_quota_file(path: &Path, file: &QuotaFile) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(file)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let tmp = dir.join(format!(".quotas.tmp.{}", std::process::id()));

    let mut out = std::fs::File::create(&tmp)?;
    out.write_all(json.as_bytes())?;
    out.sync_all()?;
    drop(out);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Flatten a model listing into per-model quota entries. Models without
/// quota info are skipped.
pub fn quotas_from_models(reply: &ModelsReply) -> HashMap<String, ModelQuota> {
    reply
        .models
        .iter()
        .filter_map(|(model_id, info)| {
            info.quota_info.as_ref().map(|quota| {
                (
                    model_id.clone(),
                    ModelQuota {
                        remaining: quota.remaining_fraction,
                        reset_time: quota.reset_time.clone(),
                    },
                )
            })
        })
        .collect()
}

/// Spawn the hourly sweep that evicts expired quota records.
///
/// Returns the task handle so callers can abort it on shutdown.
pub fn spawn_quota_sweep(
    cache: Arc<QuotaCache>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick: the cache was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = cache.cleanup().await;
            debug!(removed, "quota sweep cycle complete");
        }
    })
}
