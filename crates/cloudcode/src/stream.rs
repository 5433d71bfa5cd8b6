//! Translation of the vendor's chunked SSE stream into normalized events.
//!
//! `streamGenerateContent?alt=sse` answers with `data: ` lines, each holding
//! one JSON envelope, split across transport chunks at arbitrary byte
//! boundaries. [`StreamTranslator`] reassembles lines and flattens the parts
//! into a sequence of [`StreamEvent`]s with three guarantees:
//!
//! - thinking markers are paired and never nested: `ThinkingStart` opens a
//!   phase exactly once, and the phase is closed by the first non-thought
//!   part or by the terminal chunk;
//! - tool calls are batched and emitted exactly once, on the terminal chunk;
//! - the usage event carries zero for any counter the vendor omitted.
//!
//! One translator serves one stream; state never crosses requests.

use serde::Serialize;

use crate::wire::{GenerateEnvelope, Part, UsageMetadata};

const DATA_PREFIX: &str = "data: ";

/// Normalized generation event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A reasoning phase opened.
    ThinkingStart,
    /// Reasoning text.
    Thinking(String),
    /// The open reasoning phase closed.
    ThinkingEnd,
    /// Answer text.
    Text(String),
    /// The complete tool-call batch, delivered once at stream end.
    ToolCalls(Vec<ToolCall>),
    /// Token accounting, delivered at stream end when the vendor sent any.
    Usage(Usage),
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    /// Position within the batch, in arrival order.
    pub index: usize,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<UsageMetadata> for Usage {
    fn from(meta: UsageMetadata) -> Self {
        Self {
            prompt_tokens: meta.prompt_token_count,
            completion_tokens: meta.candidates_token_count,
            total_tokens: meta.total_token_count,
        }
    }
}

/// Line-buffering state machine over one SSE stream.
#[derive(Debug, Default)]
pub struct StreamTranslator {
    line_buffer: String,
    thinking_open: bool,
    tool_calls: Vec<ToolCall>,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk; returns the events completed by it.
    ///
    /// A trailing fragment without its newline stays buffered for the next
    /// chunk.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.line_buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.line_buffer.find('\n') {
            let mut line: String = self.line_buffer.drain(..=newline).collect();
            line.pop();
            self.process_line(&line, &mut events);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        // Anything that does not parse is dropped; the stream carries no
        // recovery marker for a garbled line.
        let Ok(envelope) = serde_json::from_str::<GenerateEnvelope>(payload) else {
            return;
        };
        let Some(response) = envelope.response else {
            return;
        };

        let candidate = response.candidates.first();
        if let Some(content) = candidate.and_then(|c| c.content.as_ref()) {
            for part in &content.parts {
                self.process_part(part, events);
            }
        }
        if candidate.and_then(|c| c.finish_reason.as_deref()).is_some() {
            self.finish(response.usage_metadata, events);
        }
    }

    fn process_part(&mut self, part: &Part, events: &mut Vec<StreamEvent>) {
        if part.thought {
            if !self.thinking_open {
                self.thinking_open = true;
                events.push(StreamEvent::ThinkingStart);
            }
            events.push(StreamEvent::Thinking(
                part.text.clone().unwrap_or_default(),
            ));
        } else if let Some(text) = &part.text {
            self.close_thinking(events);
            events.push(StreamEvent::Text(text.clone()));
        } else if let Some(call) = &part.function_call {
            self.tool_calls.push(ToolCall {
                id: call.id.clone().unwrap_or_else(generate_tool_call_id),
                index: self.tool_calls.len(),
                name: call.name.clone(),
                arguments: encode_args(call.args.as_ref()),
            });
        }
    }

    fn finish(&mut self, usage: Option<UsageMetadata>, events: &mut Vec<StreamEvent>) {
        self.close_thinking(events);
        if !self.tool_calls.is_empty() {
            events.push(StreamEvent::ToolCalls(std::mem::take(&mut self.tool_calls)));
        }
        if let Some(usage) = usage {
            events.push(StreamEvent::Usage(usage.into()));
        }
    }

    fn close_thinking(&mut self, events: &mut Vec<StreamEvent>) {
        if self.thinking_open {
            self.thinking_open = false;
            events.push(StreamEvent::ThinkingEnd);
        }
    }
}

/// Flattened form of a non-streaming reply.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub thinking: String,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Flatten a `generateContent` reply, which carries the same part shapes as
/// the stream in a single document.
pub fn collect(envelope: &GenerateEnvelope) -> Completion {
    let mut completion = Completion::default();
    let Some(response) = &envelope.response else {
        return completion;
    };
    let candidate = response.candidates.first();
    if let Some(content) = candidate.and_then(|c| c.content.as_ref()) {
        for part in &content.parts {
            if part.thought {
                completion
                    .thinking
                    .push_str(part.text.as_deref().unwrap_or_default());
            } else if let Some(text) = &part.text {
                completion.text.push_str(text);
            } else if let Some(call) = &part.function_call {
                completion.tool_calls.push(ToolCall {
                    id: call.id.clone().unwrap_or_else(generate_tool_call_id),
                    index: completion.tool_calls.len(),
                    name: call.name.clone(),
                    arguments: encode_args(call.args.as_ref()),
                });
            }
        }
    }
    if let Some(usage) = response.usage_metadata {
        completion.usage = usage.into();
    }
    completion
}

fn encode_args(args: Option<&serde_json::Value>) -> String {
    args.map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_owned())
}

/// Tool calls sometimes arrive without an id; downstream protocols need one.
fn generate_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().as_simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_line(payload: serde_json::Value) -> String {
        format!("data: {payload}\n")
    }

    fn parts_chunk(parts: serde_json::Value) -> String {
        data_line(json!({
            "response": {"candidates": [{"content": {"parts": parts}}]}
        }))
    }

    fn finish_chunk(usage: serde_json::Value) -> String {
        data_line(json!({
            "response": {
                "candidates": [{"finishReason": "STOP"}],
                "usageMetadata": usage
            }
        }))
    }

    #[test]
    fn thinking_text_and_tool_call_emit_in_order() {
        let mut translator = StreamTranslator::new();

        let mut events = translator.push(&parts_chunk(json!([
            {"thought": true, "text": "a"},
            {"thought": true, "text": "b"},
            {"text": "c"},
            {"functionCall": {"id": "call_1", "name": "f1", "args": {"x": 1}}}
        ])));
        events.extend(translator.push(&finish_chunk(json!({}))));

        assert_eq!(
            events,
            vec![
                StreamEvent::ThinkingStart,
                StreamEvent::Thinking("a".into()),
                StreamEvent::Thinking("b".into()),
                StreamEvent::ThinkingEnd,
                StreamEvent::Text("c".into()),
                StreamEvent::ToolCalls(vec![ToolCall {
                    id: "call_1".into(),
                    index: 0,
                    name: "f1".into(),
                    arguments: r#"{"x":1}"#.into(),
                }]),
                StreamEvent::Usage(Usage::default()),
            ]
        );
    }

    #[test]
    fn terminal_chunk_closes_an_open_thinking_phase() {
        let mut translator = StreamTranslator::new();
        let mut events = translator.push(&parts_chunk(json!([
            {"thought": true, "text": "only thoughts"}
        ])));
        events.extend(translator.push(&finish_chunk(json!({"totalTokenCount": 3}))));

        assert_eq!(
            events,
            vec![
                StreamEvent::ThinkingStart,
                StreamEvent::Thinking("only thoughts".into()),
                StreamEvent::ThinkingEnd,
                StreamEvent::Usage(Usage {
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    total_tokens: 3,
                }),
            ]
        );
    }

    #[test]
    fn tool_calls_are_held_until_the_terminal_chunk() {
        let mut translator = StreamTranslator::new();

        let first = translator.push(&parts_chunk(json!([
            {"functionCall": {"id": "call_a", "name": "alpha", "args": {}}}
        ])));
        assert!(first.is_empty(), "batch must not flush mid-stream: {first:?}");

        let second = translator.push(&parts_chunk(json!([
            {"functionCall": {"id": "call_b", "name": "beta", "args": {"n": 2}}}
        ])));
        assert!(second.is_empty());

        let final_events = translator.push(&finish_chunk(json!({})));
        let StreamEvent::ToolCalls(batch) = &final_events[0] else {
            panic!("expected a tool-call batch, got {final_events:?}");
        };
        assert_eq!(batch.len(), 2);
        assert_eq!((batch[0].index, batch[0].name.as_str()), (0, "alpha"));
        assert_eq!((batch[1].index, batch[1].name.as_str()), (1, "beta"));
    }

    #[test]
    fn repeating_the_terminal_chunk_emits_the_batch_once() {
        let mut translator = StreamTranslator::new();
        translator.push(&parts_chunk(json!([
            {"functionCall": {"id": "call_a", "name": "alpha", "args": {}}}
        ])));

        let terminal = finish_chunk(json!({}));
        let first = translator.push(&terminal);
        assert!(matches!(first[0], StreamEvent::ToolCalls(_)));

        let again = translator.push(&terminal);
        assert!(
            !again.iter().any(|e| matches!(e, StreamEvent::ToolCalls(_))),
            "second terminal chunk re-emitted the batch: {again:?}"
        );
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let mut translator = StreamTranslator::new();
        let line = parts_chunk(json!([{"text": "hello world"}]));
        let (head, tail) = line.split_at(line.len() / 2);

        assert!(translator.push(head).is_empty());
        let events = translator.push(tail);
        assert_eq!(events, vec![StreamEvent::Text("hello world".into())]);
    }

    #[test]
    fn non_data_and_malformed_lines_are_dropped() {
        let mut translator = StreamTranslator::new();
        let events = translator.push(concat!(
            "event: ping\n",
            "\n",
            ": keepalive\n",
            "data: {not json}\n",
            "data: {\"response\": {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"ok\"}]}}]}}\n",
        ));
        assert_eq!(events, vec![StreamEvent::Text("ok".into())]);
    }

    #[test]
    fn missing_tool_call_id_gets_a_generated_one() {
        let mut translator = StreamTranslator::new();
        translator.push(&parts_chunk(json!([
            {"functionCall": {"name": "gamma"}}
        ])));
        let events = translator.push(&finish_chunk(json!({})));

        let StreamEvent::ToolCalls(batch) = &events[0] else {
            panic!("expected a tool-call batch, got {events:?}");
        };
        assert!(batch[0].id.starts_with("call_"), "id: {}", batch[0].id);
        assert_eq!(batch[0].arguments, "{}");
    }

    #[test]
    fn finish_without_usage_metadata_emits_no_usage_event() {
        let mut translator = StreamTranslator::new();
        let events = translator.push(&data_line(json!({
            "response": {"candidates": [{"finishReason": "STOP"}]}
        })));
        assert!(events.is_empty(), "got {events:?}");
    }

    #[test]
    fn thought_part_without_text_still_emits_an_empty_thinking_event() {
        let mut translator = StreamTranslator::new();
        let events = translator.push(&parts_chunk(json!([{"thought": true}])));
        assert_eq!(
            events,
            vec![StreamEvent::ThinkingStart, StreamEvent::Thinking(String::new())]
        );
    }

    #[test]
    fn collect_flattens_a_non_streaming_reply() {
        let envelope: GenerateEnvelope = serde_json::from_value(json!({
            "response": {
                "candidates": [{
                    "content": {"parts": [
                        {"thought": true, "text": "weighing options"},
                        {"text": "answer"},
                        {"functionCall": {"id": "call_z", "name": "zeta", "args": {"k": "v"}}}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 5, "totalTokenCount": 9}
            }
        }))
        .unwrap();

        let completion = collect(&envelope);
        assert_eq!(completion.thinking, "weighing options");
        assert_eq!(completion.text, "answer");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "zeta");
        assert_eq!(completion.usage.total_tokens, 9);
    }

    #[test]
    fn collect_of_an_empty_envelope_is_all_defaults() {
        let completion = collect(&GenerateEnvelope::default());
        assert!(completion.thinking.is_empty());
        assert!(completion.text.is_empty());
        assert!(completion.tool_calls.is_empty());
        assert_eq!(completion.usage, Usage::default());
    }
}
