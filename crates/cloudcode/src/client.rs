//! HTTP client for the CloudCode `v1internal` endpoints

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header;
use tracing::debug;

use crate::error::{Error, Result};
use crate::stream::{StreamEvent, StreamTranslator};
use crate::wire::{GenerateEnvelope, GenerateRequest, LoadAssistReply, ModelsReply};

/// Endpoint set and request defaults for one CloudCode deployment.
///
/// Kept as data so tests (and alternative deployments) can point the client
/// at any base URL.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// `streamGenerateContent` endpoint, with `alt=sse`.
    pub stream_url: String,
    /// `generateContent` endpoint.
    pub generate_url: String,
    /// `fetchAvailableModels` endpoint.
    pub models_url: String,
    /// `loadCodeAssist` endpoint (eligibility probe).
    pub assist_url: String,
    pub user_agent: String,
    /// Per-call deadline, covering the full body for streams.
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            stream_url:
                "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:streamGenerateContent?alt=sse"
                    .into(),
            generate_url:
                "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:generateContent"
                    .into(),
            models_url:
                "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:fetchAvailableModels"
                    .into(),
            assist_url:
                "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:loadCodeAssist"
                    .into(),
            user_agent: "antigravity/1.11.3 windows/amd64".into(),
            timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloudCodeClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl CloudCodeClient {
    pub fn new(http: reqwest::Client, config: ApiConfig) -> Self {
        Self { http, config }
    }

    /// Run a streaming generation, feeding each normalized event to
    /// `on_event` as it is decoded.
    ///
    /// A non-success status is reported before any event fires; transport
    /// failures mid-stream abort after the events already delivered.
    pub async fn stream_generate<F>(
        &self,
        access_token: &str,
        request: &GenerateRequest,
        mut on_event: F,
    ) -> Result<()>
    where
        F: FnMut(StreamEvent),
    {
        debug!(model = %request.model, "starting streaming generation");
        let response = self
            .post_json(&self.config.stream_url, access_token)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let mut translator = StreamTranslator::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Http(e.to_string()))?;
            let text = String::from_utf8_lossy(&chunk);
            for event in translator.push(&text) {
                on_event(event);
            }
        }
        Ok(())
    }

    /// Run a non-streaming generation and return the decoded envelope.
    pub async fn generate(
        &self,
        access_token: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateEnvelope> {
        debug!(model = %request.model, "starting non-streaming generation");
        let response = self
            .post_json(&self.config.generate_url, access_token)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .json::<GenerateEnvelope>()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }

    /// Fetch the model listing (with per-model quota info) for a credential.
    pub async fn fetch_models(&self, access_token: &str) -> Result<ModelsReply> {
        let response = self
            .post_json(&self.config.models_url, access_token)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .json::<ModelsReply>()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }

    /// Probe `loadCodeAssist` for the credential's companion project.
    ///
    /// `Ok(None)` means the endpoint answered but the account carries no
    /// project, which the pool treats as ineligible.
    pub async fn fetch_project_id(&self, access_token: &str) -> Result<Option<String>> {
        let response = self
            .post_json(&self.config.assist_url, access_token)
            .json(&serde_json::json!({"metadata": {"ideType": "ANTIGRAVITY"}}))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let response = Self::check_status(response).await?;
        let reply = response
            .json::<LoadAssistReply>()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;
        Ok(reply.cloudaicompanion_project)
    }

    fn post_json(&self, url: &str, access_token: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .timeout(self.config.timeout)
            .header(header::USER_AGENT, &self.config.user_agent)
            .bearer_auth(access_token)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unreadable body>"));
        Err(Error::Upstream {
            status: status.as_u16(),
            body,
        })
    }
}
