//! Adapter for OpenAI-compatible chat completion endpoints (OpenAI, Groq,
//! xAI). Translates the part-based transcript to the wire message format,
//! streams the response as server-sent events, and reassembles incrementally
//! streamed tool-call arguments into whole [`ModelEvent::ToolCall`]s.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use parley_core::chat::{ConversationMessage, MessagePart, Role};
use parley_mcp::ToolDescriptor;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ModelError, ModelEvent, ModelProvider, ModelStream, StepRequest, ToolCallRequest};

pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    async fn stream_step(&self, request: StepRequest) -> Result<ModelStream, ModelError> {
        let mut body = json!({
            "model": request.model,
            "messages": to_wire_messages(&request.system, &request.messages),
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(tool_definitions(&request.tools));
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut assembler = ChunkAssembler::new();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(ModelError::Http(err));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                // Events are separated by a blank line; anything after the
                // last separator is an incomplete event kept for later.
                while let Some(boundary) = buffer.find("\n\n") {
                    let event = buffer[..boundary].to_string();
                    buffer.drain(..boundary + 2);
                    for payload in data_payloads(&event) {
                        if payload == "[DONE]" {
                            for item in assembler.finish() {
                                yield item;
                            }
                            return;
                        }
                        for item in assembler.push(&payload) {
                            yield item;
                        }
                    }
                }
            }
            // Stream ended without [DONE]; flush whatever was assembled.
            for item in assembler.finish() {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Extract the `data:` payloads from one SSE event block.
fn data_payloads(event: &str) -> Vec<String> {
    event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data:")
                .map(|rest| rest.trim_start().to_string())
        })
        .collect()
}

/// Flatten part-based messages to the wire format. An assistant message that
/// carries tool calls becomes an assistant message with a `tool_calls` array
/// followed by one `tool` message per result; reasoning parts never go back
/// on the wire.
pub fn to_wire_messages(system: &str, messages: &[ConversationMessage]) -> Vec<Value> {
    let mut wire = vec![json!({"role": "system", "content": system})];
    for message in messages {
        match message.role {
            Role::User => {
                wire.push(json!({"role": "user", "content": message.text_content()}));
            }
            Role::System => {
                wire.push(json!({"role": "system", "content": message.text_content()}));
            }
            Role::Assistant => {
                let text = message.text_content();
                let mut tool_calls = Vec::new();
                let mut results = Vec::new();
                for part in &message.parts {
                    match part {
                        MessagePart::ToolCall {
                            tool_name,
                            args,
                            call_id,
                        } => tool_calls.push(json!({
                            "id": call_id,
                            "type": "function",
                            "function": {
                                "name": tool_name,
                                "arguments": args.to_string(),
                            },
                        })),
                        MessagePart::ToolResult {
                            call_id,
                            result,
                            error,
                        } => {
                            let content = match (result, error) {
                                (Some(value), _) => value.to_string(),
                                (None, Some(message)) => {
                                    json!({"error": message}).to_string()
                                }
                                (None, None) => "null".to_string(),
                            };
                            results.push(json!({
                                "role": "tool",
                                "tool_call_id": call_id,
                                "content": content,
                            }));
                        }
                        MessagePart::Text { .. } | MessagePart::Reasoning { .. } => {}
                    }
                }
                let mut assistant = json!({"role": "assistant"});
                assistant["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                if !tool_calls.is_empty() {
                    assistant["tool_calls"] = Value::Array(tool_calls);
                }
                wire.push(assistant);
                wire.extend(results);
            }
        }
    }
    wire
}

fn tool_definitions(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                },
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles completion chunks into model events. Text deltas pass through
/// immediately; tool calls arrive spread over many chunks (id and name first,
/// then argument fragments) and are emitted whole once the choice finishes.
struct ChunkAssembler {
    pending: BTreeMap<usize, PendingToolCall>,
}

impl ChunkAssembler {
    fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    fn push(&mut self, payload: &str) -> Vec<Result<ModelEvent, ModelError>> {
        let chunk: CompletionChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                return vec![Err(ModelError::Malformed(format!(
                    "unparseable completion chunk: {err}"
                )))];
            }
        };

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content
                && !content.is_empty()
            {
                events.push(Ok(ModelEvent::TextDelta(content)));
            }
            for delta in choice.delta.tool_calls {
                let pending = self.pending.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    pending.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        pending.name = name;
                    }
                    if let Some(fragment) = function.arguments {
                        pending.arguments.push_str(&fragment);
                    }
                }
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                events.extend(self.finish());
            }
        }
        events
    }

    /// Emit all assembled tool calls in stream order.
    fn finish(&mut self) -> Vec<Result<ModelEvent, ModelError>> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|call| {
                let args: Value = if call.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.arguments).map_err(|err| {
                        ModelError::Malformed(format!(
                            "tool call '{}' carried unparseable arguments: {err}",
                            call.name
                        ))
                    })?
                };
                Ok(ModelEvent::ToolCall(ToolCallRequest {
                    call_id: call.id,
                    name: call.name,
                    args,
                }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(role: Role, parts: Vec<MessagePart>) -> ConversationMessage {
        ConversationMessage {
            id: "m1".to_string(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn wire_messages_start_with_the_system_prompt() {
        let wire = to_wire_messages(
            "be brief",
            &[message(
                Role::User,
                vec![MessagePart::Text {
                    text: "hi".to_string(),
                }],
            )],
        );
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[0]["content"], "be brief");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"], "hi");
    }

    #[test]
    fn assistant_tool_parts_split_into_tool_call_and_tool_messages() {
        let wire = to_wire_messages(
            "sys",
            &[message(
                Role::Assistant,
                vec![
                    MessagePart::Text {
                        text: "checking".to_string(),
                    },
                    MessagePart::ToolCall {
                        tool_name: "search".to_string(),
                        args: json!({"q": "rust"}),
                        call_id: "call_1".to_string(),
                    },
                    MessagePart::ToolResult {
                        call_id: "call_1".to_string(),
                        result: Some(json!({"hits": 3})),
                        error: None,
                    },
                ],
            )],
        );
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["content"], "checking");
        assert_eq!(wire[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "search");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
        assert_eq!(wire[2]["content"], r#"{"hits":3}"#);
    }

    #[test]
    fn reasoning_parts_stay_off_the_wire() {
        let wire = to_wire_messages(
            "sys",
            &[message(
                Role::Assistant,
                vec![
                    MessagePart::Reasoning {
                        text: "private deliberation".to_string(),
                    },
                    MessagePart::Text {
                        text: "answer".to_string(),
                    },
                ],
            )],
        );
        assert_eq!(wire[1]["content"], "answer");
        assert!(!wire[1].to_string().contains("deliberation"));
    }

    #[test]
    fn failed_tool_result_is_sent_as_error_content() {
        let wire = to_wire_messages(
            "sys",
            &[message(
                Role::Assistant,
                vec![
                    MessagePart::ToolCall {
                        tool_name: "lookup".to_string(),
                        args: json!({}),
                        call_id: "call_2".to_string(),
                    },
                    MessagePart::ToolResult {
                        call_id: "call_2".to_string(),
                        result: None,
                        error: Some("upstream timeout".to_string()),
                    },
                ],
            )],
        );
        assert_eq!(wire[1]["content"], Value::Null);
        assert_eq!(wire[2]["content"], r#"{"error":"upstream timeout"}"#);
    }

    #[test]
    fn assembler_passes_text_deltas_through() {
        let mut assembler = ChunkAssembler::new();
        let events = assembler
            .push(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(events, vec![ModelEvent::TextDelta("Hel".to_string())]);
    }

    #[test]
    fn assembler_reassembles_fragmented_tool_call_arguments() {
        let mut assembler = ChunkAssembler::new();
        assert!(
            assembler
                .push(
                    r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_7","function":{"name":"weather","arguments":""}}]}}]}"#
                )
                .is_empty()
        );
        assert!(
            assembler
                .push(
                    r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]}}]}"#
                )
                .is_empty()
        );
        assert!(
            assembler
                .push(
                    r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Oslo\"}"}}]}}]}"#
                )
                .is_empty()
        );
        let events = assembler
            .push(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(
            events,
            vec![ModelEvent::ToolCall(ToolCallRequest {
                call_id: "call_7".to_string(),
                name: "weather".to_string(),
                args: json!({"city": "Oslo"}),
            })]
        );
    }

    #[test]
    fn assembler_emits_parallel_tool_calls_in_index_order() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":1,"id":"call_b","function":{"name":"second","arguments":"{}"}},
                {"index":0,"id":"call_a","function":{"name":"first","arguments":"{}"}}
            ]}}]}"#,
        );
        let events = assembler
            .finish()
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let names: Vec<&str> = events
            .iter()
            .map(|event| match event {
                ModelEvent::ToolCall(call) => call.name.as_str(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn unparseable_arguments_surface_as_malformed() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_x","function":{"name":"broken","arguments":"{not json"}}]}}]}"#,
        );
        let events = assembler.finish();
        assert!(matches!(events[0], Err(ModelError::Malformed(_))));
    }

    #[test]
    fn data_payloads_strip_the_field_prefix() {
        let payloads = data_payloads("event: message\ndata: {\"a\":1}\ndata: [DONE]");
        assert_eq!(payloads, vec![r#"{"a":1}"#.to_string(), "[DONE]".to_string()]);
    }
}
