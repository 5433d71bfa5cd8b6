//! Credential administration API
//!
//! CRUD over the stored credentials, a pool reload trigger, and the
//! per-credential quota view. Every reply is a `{ success, ... }` envelope.
//! This router binds its own listener (loopback by default) and carries no
//! API-key guard; keeping it off the public port is the deployment's job.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use cloudcode::CloudCodeClient;
use gemini_auth::credentials::CredentialRecord;
use gemini_auth::token_suffix;
use gemini_pool::{QuotaCache, QuotaRecord, Rotator, quotas_from_models};
use serde::Deserialize;
use tracing::{error, info, warn};

/// Shared state for the admin surface.
#[derive(Clone)]
pub struct AdminState {
    pub rotator: Arc<Rotator>,
    pub quotas: Arc<QuotaCache>,
    pub client: CloudCodeClient,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tokens", get(list_tokens).post(add_token))
        .route("/admin/tokens/reload", post(reload_pool))
        .route(
            "/admin/tokens/{refresh_token}",
            put(update_token).delete(delete_token),
        )
        .route("/admin/tokens/{refresh_token}/quotas", get(token_quotas))
        .with_state(state)
}

/// Body of `POST /admin/tokens`. Only the token pair is mandatory; the
/// store fills lifetime defaults for the rest.
#[derive(Debug, Deserialize)]
struct NewToken {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    timestamp: Option<u64>,
    enable: Option<bool>,
    #[serde(rename = "projectId")]
    project_id: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuotaQuery {
    refresh: Option<bool>,
}

async fn list_tokens(State(state): State<AdminState>) -> Response {
    match state.rotator.list().await {
        Ok(summaries) => envelope(
            StatusCode::OK,
            serde_json::json!({ "success": true, "data": summaries }),
        ),
        Err(e) => admin_failure(&e),
    }
}

async fn add_token(State(state): State<AdminState>, Json(body): Json<NewToken>) -> Response {
    let (Some(access_token), Some(refresh_token)) = (body.access_token, body.refresh_token) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "access_token and refresh_token are required",
        );
    };

    let record = CredentialRecord {
        access_token,
        refresh_token,
        expires_in: body.expires_in,
        timestamp: body.timestamp,
        enable: body.enable,
        project_id: body.project_id,
        email: body.email,
        session_id: String::new(),
    };

    match state.rotator.add(record).await {
        Ok(()) => {
            info!("credential added through the admin API");
            envelope(
                StatusCode::OK,
                serde_json::json!({ "success": true, "message": "credential added" }),
            )
        }
        Err(e @ gemini_pool::Error::Duplicate(_)) => {
            failure(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => admin_failure(&e),
    }
}

async fn update_token(
    State(state): State<AdminState>,
    Path(refresh_token): Path<String>,
    Json(patch): Json<gemini_pool::CredentialPatch>,
) -> Response {
    match state.rotator.update(&refresh_token, patch).await {
        Ok(()) => envelope(
            StatusCode::OK,
            serde_json::json!({ "success": true, "message": "credential updated" }),
        ),
        Err(e @ gemini_pool::Error::NotFound(_)) => failure(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => admin_failure(&e),
    }
}

async fn delete_token(
    State(state): State<AdminState>,
    Path(refresh_token): Path<String>,
) -> Response {
    match state.rotator.delete(&refresh_token).await {
        Ok(()) => {
            info!(
                token = %token_suffix(&refresh_token),
                "credential deleted through the admin API"
            );
            envelope(
                StatusCode::OK,
                serde_json::json!({ "success": true, "message": "credential deleted" }),
            )
        }
        Err(e @ gemini_pool::Error::NotFound(_)) => failure(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => admin_failure(&e),
    }
}

async fn reload_pool(State(state): State<AdminState>) -> Response {
    match state.rotator.reload().await {
        Ok(accounts) => {
            info!(accounts, "pool reloaded through the admin API");
            envelope(
                StatusCode::OK,
                serde_json::json!({
                    "success": true,
                    "message": "pool reloaded",
                    "data": { "accounts": accounts },
                }),
            )
        }
        Err(e) => admin_failure(&e),
    }
}

/// Per-credential quota view. Serves the cached snapshot while it is fresh;
/// `?refresh=true` forces a fetch. The lookup refreshes the access token
/// first when it is near expiry, so the fetch path always has a live token.
async fn token_quotas(
    State(state): State<AdminState>,
    Path(refresh_token): Path<String>,
    Query(query): Query<QuotaQuery>,
) -> Response {
    let record = match state.rotator.refresh_credential(&refresh_token).await {
        Ok(record) => record,
        Err(e @ gemini_pool::Error::NotFound(_)) => {
            return failure(StatusCode::NOT_FOUND, e.to_string());
        }
        Err(e @ gemini_pool::Error::Refresh(_)) => {
            warn!(
                token = %token_suffix(&refresh_token),
                error = %e,
                "quota lookup could not refresh the credential"
            );
            return failure(StatusCode::UNAUTHORIZED, e.to_string());
        }
        Err(e) => return admin_failure(&e),
    };

    let force = query.refresh.unwrap_or(false);
    if !force && let Some(cached) = state.quotas.get(&refresh_token).await {
        return quota_reply(&cached);
    }

    match state.client.fetch_models(&record.access_token).await {
        Ok(reply) => {
            let stored = state
                .quotas
                .update(&refresh_token, quotas_from_models(&reply))
                .await;
            quota_reply(&stored)
        }
        Err(e) => {
            if let cloudcode::Error::Upstream { status, body } = &e
                && cloudcode::classify_generation(*status, body)
                    == cloudcode::ErrorClass::PermissionDenied
            {
                state.rotator.disable(&refresh_token).await;
            }
            error!(
                token = %token_suffix(&refresh_token),
                error = %e,
                "quota fetch failed"
            );
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn quota_reply(record: &QuotaRecord) -> Response {
    let mut ids: Vec<&String> = record.models.keys().collect();
    ids.sort();
    let mut models = serde_json::Map::new();
    for id in ids {
        if let Some(quota) = record.models.get(id) {
            models.insert(
                id.clone(),
                serde_json::json!({
                    "remaining": quota.remaining,
                    "resetTime": quota.reset_time,
                }),
            );
        }
    }
    envelope(
        StatusCode::OK,
        serde_json::json!({
            "success": true,
            "data": { "lastUpdated": record.last_updated, "models": models },
        }),
    )
}

fn admin_failure(error: &gemini_pool::Error) -> Response {
    error!(error = %error, "admin operation failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    envelope(
        status,
        serde_json::json!({ "success": false, "message": message.into() }),
    )
}

fn envelope(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use cloudcode::ApiConfig;
    use gemini_auth::credentials::{CredentialFile, CredentialRepo, now_ms};
    use gemini_pool::RotatorOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn record(access: &str, refresh: &str) -> CredentialRecord {
        CredentialRecord {
            access_token: access.into(),
            refresh_token: refresh.into(),
            expires_in: Some(3599),
            timestamp: Some(now_ms()),
            enable: None,
            project_id: Some("proj-1".into()),
            email: Some("a@example.com".into()),
            session_id: String::new(),
        }
    }

    fn api_config(base: &str) -> ApiConfig {
        ApiConfig {
            stream_url: format!("{base}/stream"),
            generate_url: format!("{base}/generate"),
            models_url: format!("{base}/models"),
            assist_url: format!("{base}/assist"),
            user_agent: "gateway-test".into(),
            timeout: Duration::from_secs(5),
        }
    }

    async fn start_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn build_admin(dir: &TempDir, base: &str, records: &[CredentialRecord]) -> Router {
        let store = CredentialFile::open(dir.path().join("accounts.json")).unwrap();
        store.write_all(records).unwrap();

        let http = reqwest::Client::new();
        let client = CloudCodeClient::new(http.clone(), api_config(base));
        let rotator = Arc::new(Rotator::new(
            Arc::new(store),
            http,
            client.clone(),
            RotatorOptions {
                token_url: format!("{base}/token"),
                skip_eligibility_check: false,
            },
        ));
        rotator.reload().await.unwrap();

        build_admin_router(AdminState {
            rotator,
            quotas: Arc::new(QuotaCache::open(dir.path().join("quotas.json"))),
            client,
        })
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn reopen(dir: &TempDir) -> Vec<CredentialRecord> {
        CredentialFile::open(dir.path().join("accounts.json"))
            .unwrap()
            .read_all()
            .unwrap()
    }

    #[tokio::test]
    async fn list_tokens_returns_sanitized_summaries() {
        let dir = TempDir::new().unwrap();
        let router = build_admin(
            &dir,
            "http://127.0.0.1:9",
            &[record("access-token-live-1", "rt-1")],
        )
        .await;

        let response = router.oneshot(get_request("/admin/tokens")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listing = response_json(response).await;
        assert_eq!(listing["success"], true);
        assert_eq!(listing["data"][0]["refresh_token"], "rt-1");
        assert_eq!(
            listing["data"][0]["access_token_suffix"],
            token_suffix("access-token-live-1")
        );
        assert!(
            listing["data"][0].get("access_token").is_none(),
            "full access tokens never leave the admin API"
        );
    }

    #[tokio::test]
    async fn add_token_persists_and_fills_lifetime_defaults() {
        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, "http://127.0.0.1:9", &[record("at-1", "rt-1")]).await;

        let response = router
            .oneshot(json_request(
                "POST",
                "/admin/tokens",
                &serde_json::json!({
                    "access_token": "at-2",
                    "refresh_token": "rt-2",
                    "projectId": "proj-2",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let reply = response_json(response).await;
        assert_eq!(reply["success"], true);

        let records = reopen(&dir);
        assert_eq!(records.len(), 2);
        let added = &records[1];
        assert_eq!(added.refresh_token, "rt-2");
        assert_eq!(added.expires_in, Some(3599));
        assert_eq!(added.enable, Some(true));
        assert!(added.timestamp.is_some());
    }

    #[tokio::test]
    async fn add_token_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, "http://127.0.0.1:9", &[record("at-1", "rt-1")]).await;

        let response = router
            .oneshot(json_request(
                "POST",
                "/admin/tokens",
                &serde_json::json!({ "access_token": "at-x", "refresh_token": "rt-1" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let reply = response_json(response).await;
        assert_eq!(reply["success"], false);
        assert!(
            reply["message"]
                .as_str()
                .unwrap()
                .contains("duplicate refresh token")
        );
        assert_eq!(reopen(&dir).len(), 1);
    }

    #[tokio::test]
    async fn add_token_requires_both_tokens() {
        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, "http://127.0.0.1:9", &[]).await;

        let response = router
            .oneshot(json_request(
                "POST",
                "/admin/tokens",
                &serde_json::json!({ "access_token": "at-only" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let reply = response_json(response).await;
        assert_eq!(reply["message"], "access_token and refresh_token are required");
    }

    #[tokio::test]
    async fn update_token_patches_and_404s_on_unknown() {
        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, "http://127.0.0.1:9", &[record("at-1", "rt-1")]).await;

        let response = router
            .clone()
            .oneshot(json_request(
                "PUT",
                "/admin/tokens/rt-1",
                &serde_json::json!({ "projectId": "proj-9", "enable": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let records = reopen(&dir);
        assert_eq!(records[0].project_id.as_deref(), Some("proj-9"));
        assert_eq!(records[0].enable, Some(false));

        let missing = router
            .oneshot(json_request(
                "PUT",
                "/admin/tokens/rt-unknown",
                &serde_json::json!({ "enable": true }),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let reply = response_json(missing).await;
        assert!(
            reply["message"]
                .as_str()
                .unwrap()
                .contains("credential not found")
        );
    }

    #[tokio::test]
    async fn delete_token_decodes_the_path_and_404s_on_unknown() {
        let dir = TempDir::new().unwrap();
        // Real refresh tokens carry a "1//" prefix, so clients URL-encode them.
        let router = build_admin(&dir, "http://127.0.0.1:9", &[record("at-1", "1//rt-1")]).await;

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("DELETE")
                    .uri("/admin/tokens/1%2F%2Frt-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(reopen(&dir).is_empty());

        let missing = router
            .oneshot(
                HttpRequest::builder()
                    .method("DELETE")
                    .uri("/admin/tokens/rt-unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reload_reports_the_pool_size() {
        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, "http://127.0.0.1:9", &[record("at-1", "rt-1")]).await;

        let response = router
            .oneshot(json_request(
                "POST",
                "/admin/tokens/reload",
                &serde_json::json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let reply = response_json(response).await;
        assert_eq!(reply["success"], true);
        assert_eq!(reply["data"]["accounts"], 1);
    }

    #[tokio::test]
    async fn quota_view_fetches_then_serves_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let upstream = Router::new().route(
            "/models",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "models": {
                        "gemini-3-pro": { "quotaInfo": {
                            "remainingFraction": 0.37,
                            "resetTime": "2026-08-25T00:00:00Z",
                        }},
                        "gemini-3-flash": { "quotaInfo": { "remainingFraction": 0.9 } },
                    }}))
                }
            }),
        );
        let base = start_mock(upstream).await;

        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, &base, &[record("at-1", "rt-1")]).await;

        let first = router
            .clone()
            .oneshot(get_request("/admin/tokens/rt-1/quotas"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let reply = response_json(first).await;
        assert_eq!(reply["success"], true);
        assert_eq!(reply["data"]["models"]["gemini-3-pro"]["remaining"], 0.37);
        assert_eq!(
            reply["data"]["models"]["gemini-3-pro"]["resetTime"],
            "2026-08-25T00:00:00Z"
        );
        assert!(reply["data"]["models"]["gemini-3-flash"]["resetTime"].is_null());
        assert!(reply["data"]["lastUpdated"].is_u64());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let second = router
            .clone()
            .oneshot(get_request("/admin/tokens/rt-1/quotas"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "fresh snapshots are cached");

        let forced = router
            .oneshot(get_request("/admin/tokens/rt-1/quotas?refresh=true"))
            .await
            .unwrap();
        assert_eq!(forced.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2, "refresh=true bypasses the cache");
    }

    #[tokio::test]
    async fn quota_view_404s_on_unknown_token() {
        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, "http://127.0.0.1:9", &[record("at-1", "rt-1")]).await;

        let response = router
            .oneshot(get_request("/admin/tokens/rt-unknown/quotas"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn quota_view_401s_when_the_refresh_fails() {
        let upstream = Router::new().route(
            "/token",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "invalid_grant" })),
                )
            }),
        );
        let base = start_mock(upstream).await;

        let dir = TempDir::new().unwrap();
        let mut stale = record("at-stale", "rt-1");
        stale.timestamp = Some(1);
        let router = build_admin(&dir, &base, &[stale]).await;

        let response = router
            .oneshot(get_request("/admin/tokens/rt-1/quotas"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let reply = response_json(response).await;
        assert_eq!(reply["success"], false);
        assert!(
            reply["message"]
                .as_str()
                .unwrap()
                .contains("token refresh failed")
        );
    }

    #[tokio::test]
    async fn quota_fetch_permission_failure_disables_the_credential() {
        let upstream = Router::new().route(
            "/models",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(serde_json::json!({ "error": { "message": "Permission denied on resource" } })),
                )
            }),
        );
        let base = start_mock(upstream).await;

        let dir = TempDir::new().unwrap();
        let router = build_admin(&dir, &base, &[record("at-1", "rt-1")]).await;

        let response = router
            .oneshot(get_request("/admin/tokens/rt-1/quotas"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let records = reopen(&dir);
        assert_eq!(records[0].enable, Some(false));
    }
}
