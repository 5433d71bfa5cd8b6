//! Wire types for the CloudCode `v1internal` endpoints.
//!
//! Only the fields the gateway actually reads or writes are modeled; the
//! vendor sends plenty more, and serde drops what we do not name. Request
//! bodies wrap the generation payload in an outer envelope carrying the
//! model, the account's companion project, and the per-process session id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Outer request envelope for `streamGenerateContent` / `generateContent`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub request: GenerationPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The generation payload proper.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationPayload {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclarations>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// Function declarations advertised to the model, passed through verbatim
/// from the caller's tool definitions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<serde_json::Value>,
}

/// A turn of conversation; used in requests (role `user`/`model`) and read
/// back out of responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One content part. Exactly one of the payload fields is normally set;
/// `thought` flags reasoning text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: serde_json::Value,
}

/// Envelope around every generation reply, streamed or not.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateEnvelope {
    #[serde(default)]
    pub response: Option<GenerateResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token accounting attached to the terminal stream chunk.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

/// Reply of `fetchAvailableModels`: models keyed by id, each optionally
/// carrying the caller's remaining quota.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsReply {
    #[serde(default)]
    pub models: HashMap<String, ModelInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    #[serde(default)]
    pub quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInfo {
    #[serde(default)]
    pub remaining_fraction: Option<f64>,
    #[serde(default)]
    pub reset_time: Option<String>,
}

/// Reply of `loadCodeAssist`. An account without a companion project is not
/// entitled to the service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadAssistReply {
    #[serde(default)]
    pub cloudaicompanion_project: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_serializes_camel_case_with_envelope() {
        let request = GenerateRequest {
            model: "gemini-3-pro".into(),
            project: Some("proj-1".into()),
            request: GenerationPayload {
                contents: vec![Content {
                    role: Some("user".into()),
                    parts: vec![Part::text("hi")],
                }],
                system_instruction: None,
                generation_config: GenerationConfig {
                    temperature: Some(1.0),
                    top_p: Some(0.85),
                    top_k: Some(50),
                    max_output_tokens: Some(8096),
                },
                tools: None,
            },
            session_id: Some("session-1".into()),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "gemini-3-pro");
        assert_eq!(value["project"], "proj-1");
        assert_eq!(value["session_id"], "session-1");
        assert_eq!(value["request"]["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(value["request"]["generationConfig"]["topP"], 0.85);
        assert_eq!(value["request"]["generationConfig"]["maxOutputTokens"], 8096);
        // Unset fields stay off the wire entirely.
        assert!(value["request"].get("systemInstruction").is_none());
        assert!(value["request"]["contents"][0]["parts"][0]
            .get("thought")
            .is_none());
    }

    #[test]
    fn response_parses_thought_and_function_call_parts() {
        let raw = r#"{
            "response": {
                "candidates": [{
                    "content": {"parts": [
                        {"thought": true, "text": "planning"},
                        {"functionCall": {"name": "lookup", "args": {"q": 1}}}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 7, "totalTokenCount": 9}
            }
        }"#;

        let envelope: GenerateEnvelope = serde_json::from_str(raw).unwrap();
        let response = envelope.response.unwrap();
        let candidate = &response.candidates[0];
        let parts = &candidate.content.as_ref().unwrap().parts;
        assert!(parts[0].thought);
        assert_eq!(parts[1].function_call.as_ref().unwrap().name, "lookup");
        assert_eq!(candidate.finish_reason.as_deref(), Some("STOP"));

        let usage = response.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, 7);
        assert_eq!(usage.candidates_token_count, 0);
        assert_eq!(usage.total_token_count, 9);
    }

    #[test]
    fn models_reply_parses_quota_info() {
        let raw = r#"{
            "models": {
                "gemini-3-pro": {"quotaInfo": {"remainingFraction": 0.5, "resetTime": "2026-01-01T00:00:00Z"}},
                "gemini-3-flash": {}
            }
        }"#;

        let reply: ModelsReply = serde_json::from_str(raw).unwrap();
        let pro = reply.models["gemini-3-pro"].quota_info.as_ref().unwrap();
        assert_eq!(pro.remaining_fraction, Some(0.5));
        assert!(reply.models["gemini-3-flash"].quota_info.is_none());
    }

    #[test]
    fn load_assist_reply_distinguishes_missing_project() {
        let entitled: LoadAssistReply =
            serde_json::from_str(r#"{"cloudaicompanionProject": "proj-9"}"#).unwrap();
        assert_eq!(entitled.cloudaicompanion_project.as_deref(), Some("proj-9"));

        let not_entitled: LoadAssistReply = serde_json::from_str("{}").unwrap();
        assert!(not_entitled.cloudaicompanion_project.is_none());
    }
}
