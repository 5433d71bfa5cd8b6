//! OpenAI-compatible wire mapping.
//!
//! Inbound `/v1/chat/completions` bodies are translated into the vendor's
//! generation envelope; normalized stream events and collected completions
//! are rendered back out as `chat.completion.chunk` / `chat.completion`
//! documents. Reasoning text crosses the boundary as ordinary content
//! wrapped in `<think>` markers, since the OpenAI chat shape has no field
//! for it.

use std::collections::HashMap;

use bytes::Bytes;
use cloudcode::wire::{
    Content, FunctionCall, FunctionResponse, GenerateRequest, GenerationConfig, GenerationPayload,
    Part, ToolDeclarations,
};
use cloudcode::{Completion, StreamEvent, ToolCall, Usage};
use gemini_auth::credentials::now_ms;
use serde::Deserialize;

use crate::config::GenerationDefaults;

/// Inbound `/v1/chat/completions` body. Sampling params fall back to the
/// configured defaults when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub tool_calls: Option<Vec<RequestToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Message content is either a bare string or an array of typed blocks.
/// Non-text blocks (images) are dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

impl MessageContent {
    /// Collapse to a single string, for system instructions and tool
    /// results.
    fn flatten(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Unsupported => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A tool invocation echoed back in assistant history.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub function: RequestFunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestFunctionCall {
    pub name: String,
    /// JSON-encoded argument object, as OpenAI callers send it.
    #[serde(default)]
    pub arguments: String,
}

/// One entry of the request's `tools` array; only the `function` payload is
/// forwarded, verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    #[serde(default)]
    pub function: serde_json::Value,
}

/// Translate an OpenAI chat request into the vendor's generation envelope.
///
/// Role mapping: `system`/`developer` messages are pulled out of the
/// transcript into `systemInstruction`; `assistant` speaks as `model`, with
/// historical `tool_calls` re-encoded as `functionCall` parts; `tool`
/// results come back as `user` turns carrying a `functionResponse` part.
/// Consecutive turns from the same speaker are merged, since the endpoint
/// rejects back-to-back turns from one role.
pub fn build_generate_request(
    request: &ChatCompletionRequest,
    defaults: &GenerationDefaults,
    project: Option<String>,
    session_id: Option<String>,
) -> GenerateRequest {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    // Function names for tool results that only carry the call id.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    let text = content.flatten();
                    if !text.is_empty() {
                        system_texts.push(text);
                    }
                }
            }
            "assistant" => {
                let mut parts = content_parts(message.content.as_ref());
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        if let Some(id) = &call.id {
                            call_names.insert(id.clone(), call.function.name.clone());
                        }
                        parts.push(Part {
                            function_call: Some(FunctionCall {
                                id: call.id.clone(),
                                name: call.function.name.clone(),
                                args: Some(parse_arguments(&call.function.arguments)),
                            }),
                            ..Part::default()
                        });
                    }
                }
                push_parts(&mut contents, "model", parts);
            }
            "tool" | "function" => {
                let name = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
                    .or_else(|| message.name.clone())
                    .unwrap_or_default();
                let text = message
                    .content
                    .as_ref()
                    .map(MessageContent::flatten)
                    .unwrap_or_default();
                let part = Part {
                    function_response: Some(FunctionResponse {
                        id: message.tool_call_id.clone(),
                        name,
                        response: serde_json::json!({ "result": text }),
                    }),
                    ..Part::default()
                };
                push_parts(&mut contents, "user", vec![part]);
            }
            _ => {
                push_parts(&mut contents, "user", content_parts(message.content.as_ref()));
            }
        }
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content {
            role: Some("user".into()),
            parts: vec![Part::text(system_texts.join("\n\n"))],
        })
    };

    GenerateRequest {
        model: request.model.clone(),
        project,
        request: GenerationPayload {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: Some(request.temperature.unwrap_or(defaults.temperature)),
                top_p: Some(request.top_p.unwrap_or(defaults.top_p)),
                top_k: Some(request.top_k.unwrap_or(defaults.top_k)),
                max_output_tokens: Some(request.max_tokens.unwrap_or(defaults.max_tokens)),
            },
            tools: request.tools.as_deref().and_then(declarations),
        },
        session_id,
    }
}

fn content_parts(content: Option<&MessageContent>) -> Vec<Part> {
    match content {
        Some(MessageContent::Text(text)) if !text.is_empty() => vec![Part::text(text.clone())],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(Part::text(text.clone())),
                ContentPart::Unsupported => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn push_parts(contents: &mut Vec<Content>, role: &str, parts: Vec<Part>) {
    if parts.is_empty() {
        return;
    }
    if let Some(last) = contents.last_mut()
        && last.role.as_deref() == Some(role)
    {
        last.parts.extend(parts);
        return;
    }
    contents.push(Content {
        role: Some(role.to_string()),
        parts,
    });
}

fn parse_arguments(arguments: &str) -> serde_json::Value {
    serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}))
}

fn declarations(tools: &[ToolDefinition]) -> Option<Vec<ToolDeclarations>> {
    let functions: Vec<serde_json::Value> = tools
        .iter()
        .map(|tool| tool.function.clone())
        .filter(|function| !function.is_null())
        .collect();
    if functions.is_empty() {
        None
    } else {
        Some(vec![ToolDeclarations {
            function_declarations: functions,
        }])
    }
}

/// Response id and creation second, shared by every chunk of one completion.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub id: String,
    pub created: u64,
}

pub fn response_meta() -> ResponseMeta {
    let ms = now_ms();
    ResponseMeta {
        id: format!("chatcmpl-{ms}"),
        created: ms / 1000,
    }
}

/// One `chat.completion.chunk` document. `finish_reason` is an explicit
/// `null` on every chunk before the terminal one.
pub fn stream_chunk(
    meta: &ResponseMeta,
    model: &str,
    delta: serde_json::Value,
    finish_reason: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "id": meta.id,
        "object": "chat.completion.chunk",
        "created": meta.created,
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
    })
}

/// Terminal chunk: empty delta, the finish reason, and whatever usage the
/// stream reported (an explicit `null` when it reported none).
pub fn final_chunk(
    meta: &ResponseMeta,
    model: &str,
    finish_reason: &str,
    usage: Option<Usage>,
) -> serde_json::Value {
    let mut chunk = stream_chunk(meta, model, serde_json::json!({}), Some(finish_reason));
    chunk["usage"] = match usage {
        Some(usage) => serde_json::to_value(usage).unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::Null,
    };
    chunk
}

/// Frame one JSON document as an SSE data line.
pub fn sse_frame(value: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

/// Stream terminator.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Per-stream rendering state: whether a tool batch went out (it flips the
/// finish reason) and the usage figures for the terminal chunk.
#[derive(Debug, Default)]
pub struct StreamRender {
    saw_tool_calls: bool,
    usage: Option<Usage>,
}

impl StreamRender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta payload for one normalized event, or `None` for events that
    /// only update terminal state.
    pub fn delta_for(&mut self, event: &StreamEvent) -> Option<serde_json::Value> {
        match event {
            StreamEvent::ThinkingStart => Some(serde_json::json!({ "content": "<think>\n" })),
            StreamEvent::Thinking(text) => Some(serde_json::json!({ "content": text })),
            StreamEvent::ThinkingEnd => Some(serde_json::json!({ "content": "\n</think>\n" })),
            StreamEvent::Text(text) => Some(serde_json::json!({ "content": text })),
            StreamEvent::ToolCalls(calls) => {
                self.saw_tool_calls = true;
                let rendered: Vec<serde_json::Value> = calls.iter().map(tool_call_value).collect();
                Some(serde_json::json!({ "tool_calls": rendered }))
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(*usage);
                None
            }
        }
    }

    pub fn finish_reason(&self) -> &'static str {
        if self.saw_tool_calls {
            "tool_calls"
        } else {
            "stop"
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

/// OpenAI rendering of one tool invocation.
pub fn tool_call_value(call: &ToolCall) -> serde_json::Value {
    serde_json::json!({
        "id": call.id,
        "index": call.index,
        "type": "function",
        "function": { "name": call.name, "arguments": call.arguments },
    })
}

/// Non-streaming `chat.completion` document. Reasoning text is inlined
/// ahead of the answer inside the same `<think>` markers the stream uses.
pub fn completion_document(
    meta: &ResponseMeta,
    model: &str,
    completion: &Completion,
) -> serde_json::Value {
    let mut content = String::new();
    if !completion.thinking.is_empty() {
        content.push_str("<think>\n");
        content.push_str(&completion.thinking);
        content.push_str("\n</think>\n");
    }
    content.push_str(&completion.text);

    let mut message = serde_json::json!({ "role": "assistant", "content": content });
    if !completion.tool_calls.is_empty() {
        let calls: Vec<serde_json::Value> =
            completion.tool_calls.iter().map(tool_call_value).collect();
        message["tool_calls"] = serde_json::Value::Array(calls);
    }
    let finish_reason = if completion.tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };

    serde_json::json!({
        "id": meta.id,
        "object": "chat.completion",
        "created": meta.created,
        "model": model,
        "choices": [{ "index": 0, "message": message, "finish_reason": finish_reason }],
        "usage": completion.usage,
    })
}

/// Failure rendered as an ordinary assistant reply, so OpenAI clients show
/// the message instead of discarding an error status. No usage key.
pub fn error_document(meta: &ResponseMeta, model: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "id": meta.id,
        "object": "chat.completion",
        "created": meta.created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": message },
            "finish_reason": "stop",
        }],
    })
}
