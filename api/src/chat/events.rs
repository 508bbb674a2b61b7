//! Wire events for the turn stream. Serialized as the `data` field of
//! server-sent events; tags and field casing match what chat clients consume.

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    /// A smoothed fragment of answer text.
    TextDelta { delta: String },
    /// A fragment of extracted reasoning, never mixed into answer deltas.
    ReasoningDelta { delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_name: String,
        args: serde_json::Value,
        call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Terminal event for a failed turn. Emitted at most once, always last.
    Error { message: String },
    /// Terminal event for a completed turn.
    Done,
}
