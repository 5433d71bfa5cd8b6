//! OpenAI-compatible routes
//!
//! Chat completions, model listing, health, and metrics, plus the API-key
//! guard on `/v1/*`. Upstream failures on the chat route are delivered as
//! assistant content with HTTP 200, since OpenAI clients render that text
//! where an error status would often be swallowed. A 403 that names a
//! missing entitlement disables the credential before the reply goes out.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use cloudcode::CloudCodeClient;
use gemini_auth::credentials::{CredentialRecord, now_ms, token_suffix};
use gemini_pool::Rotator;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::GenerationDefaults;
use crate::openai::{
    self, ChatCompletionRequest, ResponseMeta, StreamRender, build_generate_request,
};

/// Shared state for the OpenAI-compatible surface.
#[derive(Clone)]
pub struct AppState {
    pub rotator: Arc<Rotator>,
    pub client: CloudCodeClient,
    pub api_key: Option<Arc<common::Secret<String>>>,
    pub defaults: GenerationDefaults,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the main router: guarded `/v1/*` routes, open health and metrics,
/// request tracking, body-size cap, and the connection limit.
pub fn build_router(state: AppState, max_connections: usize, max_body_bytes: usize) -> Router {
    let guarded = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(guarded)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(track_requests))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Gate `/v1/*` behind the configured API key. The key is accepted bare or
/// as a Bearer value; no configured key leaves the surface open.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value));
        if provided != Some(expected.expose().as_str()) {
            warn!(
                method = %request.method(),
                path = %request.uri().path(),
                "API key verification failed"
            );
            return json_response(
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "Invalid API Key" }),
            );
        }
    }
    next.run(request).await
}

/// Request log and Prometheus counters for every route on this listener.
/// For streamed responses the duration covers time to response head.
async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    crate::metrics::record_request(status, method.as_str(), elapsed.as_secs_f64());
    info!(
        method = %method,
        path = %path,
        status,
        elapsed_ms = elapsed.as_millis() as u64,
        "request handled"
    );
    response
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    if request.messages.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "messages is required" }),
        );
    }

    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let meta = openai::response_meta();

    let Some(record) = state.rotator.acquire().await else {
        warn!(request_id = %request_id, "chat request with no credential available");
        let text = "Error: no credentials available; add an account through the admin API";
        return if request.stream {
            error_stream_response(&meta, &request.model, text)
        } else {
            json_response(
                StatusCode::OK,
                openai::error_document(&meta, &request.model, text),
            )
        };
    };

    info!(
        request_id = %request_id,
        model = %request.model,
        token = %token_suffix(&record.access_token),
        stream = request.stream,
        "chat completion dispatched"
    );

    let payload = build_generate_request(
        &request,
        &state.defaults,
        record.project_id.clone(),
        Some(record.session_id.clone()),
    );

    if request.stream {
        stream_chat(state, record, request.model, meta, payload, request_id).await
    } else {
        match state.client.generate(&record.access_token, &payload).await {
            Ok(envelope) => {
                let completion = cloudcode::collect(&envelope);
                json_response(
                    StatusCode::OK,
                    openai::completion_document(&meta, &request.model, &completion),
                )
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "non-streaming generation failed");
                let text = describe_generation_failure(&state, &record, &e).await;
                json_response(
                    StatusCode::OK,
                    openai::error_document(&meta, &request.model, &format!("Error: {text}")),
                )
            }
        }
    }
}

/// Drive a streaming generation into an SSE body. The upstream call runs in
/// a spawned task feeding a channel, so response headers go out immediately
/// and chunks flow as they decode. A failure at any point still produces a
/// well-formed chunk sequence ending in `[DONE]`.
async fn stream_chat(
    state: AppState,
    record: CredentialRecord,
    model: String,
    meta: ResponseMeta,
    payload: cloudcode::wire::GenerateRequest,
    request_id: String,
) -> Response {
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<Bytes, Infallible>>();

    tokio::spawn(async move {
        let mut render = StreamRender::new();
        let result = state
            .client
            .stream_generate(&record.access_token, &payload, |event| {
                if let Some(delta) = render.delta_for(&event) {
                    let chunk = openai::stream_chunk(&meta, &model, delta, None);
                    let _ = tx.send(Ok(openai::sse_frame(&chunk)));
                }
            })
            .await;

        if let Err(e) = result {
            error!(request_id = %request_id, error = %e, "streaming generation failed");
            let text = describe_generation_failure(&state, &record, &e).await;
            let chunk = openai::stream_chunk(
                &meta,
                &model,
                serde_json::json!({ "content": format!("Error: {text}") }),
                None,
            );
            let _ = tx.send(Ok(openai::sse_frame(&chunk)));
        }

        let terminal = openai::final_chunk(&meta, &model, render.finish_reason(), render.usage());
        let _ = tx.send(Ok(openai::sse_frame(&terminal)));
        let _ = tx.send(Ok(Bytes::from_static(openai::DONE_FRAME.as_bytes())));
    });

    let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
    (sse_headers(), Body::from_stream(stream)).into_response()
}

/// Failure before the stream opened: one content chunk, a stop chunk, the
/// terminator.
fn error_stream_response(meta: &ResponseMeta, model: &str, text: &str) -> Response {
    let content = openai::stream_chunk(meta, model, serde_json::json!({ "content": text }), None);
    let stop = openai::stream_chunk(meta, model, serde_json::json!({}), Some("stop"));
    let mut body = Vec::new();
    body.extend_from_slice(&openai::sse_frame(&content));
    body.extend_from_slice(&openai::sse_frame(&stop));
    body.extend_from_slice(openai::DONE_FRAME.as_bytes());
    (sse_headers(), body).into_response()
}

fn sse_headers() -> [(header::HeaderName, &'static str); 3] {
    [
        (header::CONTENT_TYPE, "text/event-stream"),
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
    ]
}

/// Map an upstream generation failure to the text surfaced to the caller,
/// disabling the credential when the status says it can never serve.
async fn describe_generation_failure(
    state: &AppState,
    record: &CredentialRecord,
    error: &cloudcode::Error,
) -> String {
    match error {
        cloudcode::Error::Upstream { status, body } => {
            match cloudcode::classify_generation(*status, body) {
                cloudcode::ErrorClass::QuotaExceeded => {
                    crate::metrics::record_upstream_error("context_limit");
                    format!("request exceeds the model's context window: {body}")
                }
                cloudcode::ErrorClass::PermissionDenied => {
                    crate::metrics::record_upstream_error("permission_denied");
                    state.rotator.disable(&record.refresh_token).await;
                    format!("account has no access to the API and was disabled: {body}")
                }
                _ => {
                    crate::metrics::record_upstream_error("upstream_status");
                    format!("API request failed ({status}): {body}")
                }
            }
        }
        other => {
            crate::metrics::record_upstream_error("transport");
            format!("API request failed: {other}")
        }
    }
}

async fn list_models(State(state): State<AppState>) -> Response {
    let Some(record) = state.rotator.acquire().await else {
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "error": "no credentials available; add an account through the admin API",
            }),
        );
    };

    match state.client.fetch_models(&record.access_token).await {
        Ok(reply) => {
            let created = now_ms() / 1000;
            let mut ids: Vec<&String> = reply.models.keys().collect();
            ids.sort();
            let data: Vec<serde_json::Value> = ids
                .into_iter()
                .map(|id| {
                    serde_json::json!({
                        "id": id,
                        "object": "model",
                        "created": created,
                        "owned_by": "google",
                    })
                })
                .collect();
            json_response(
                StatusCode::OK,
                serde_json::json!({ "object": "list", "data": data }),
            )
        }
        Err(e) => {
            error!(error = %e, "model listing failed");
            let text = describe_generation_failure(&state, &record, &e).await;
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": text }),
            )
        }
    }
}

/// Pool health plus process uptime. 503 only when the pool is empty.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut health = state.rotator.health().await;
    health["uptime_seconds"] = serde_json::json!(state.started_at.elapsed().as_secs());

    let status_code = match health["status"].as_str() {
        Some("unhealthy") => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
