use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One segment of a message. Order within `ConversationMessage::parts` is
/// significant: parts are appended in emission order during a turn and must
/// round-trip through persistence unchanged.
///
/// The wire tags (`text`, `reasoning`, `tool-call`, `tool-result`) and the
/// camelCase inner fields match what chat clients already consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Ordinary answer text, visible to the user.
    Text { text: String },
    /// Model-internal deliberation, extracted from the marker pair and
    /// withheld from the answer text.
    Reasoning { text: String },
    /// A tool invocation the model requested.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_name: String,
        args: serde_json::Value,
        call_id: String,
    },
    /// The outcome of a tool invocation. Exactly one of `result` / `error`
    /// is set; an error result is fed back to the model, not fatal.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

fn default_created_at() -> DateTime<Utc> {
    Utc::now()
}

/// A single message in a conversation.
///
/// Message ids are client-generated for user messages and server-generated
/// (UUIDv7 strings) for assistant messages; identity is preserved by id
/// across reconciliation writes.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(default = "default_created_at")]
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// Concatenated text content of the message (answer text only —
    /// reasoning and tool parts are skipped).
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A persisted conversation. Created lazily at turn start so an in-flight
/// turn is already discoverable by a concurrent session listing.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatSession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub messages: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
