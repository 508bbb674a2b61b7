//! POST /v1/chat — run one streaming turn.
//!
//! The handler resolves owner, model and session, opens the request-scoped
//! tool-server pool, then hands off to the driver and returns the event
//! channel as server-sent events. Dropping the response stream (client
//! disconnect included) cancels the turn; the driver's epilogue closes the
//! pool and persists whatever was produced.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{Router, routing::post};
use futures_util::Stream;
use parley_mcp::{ClientPool, PoolConfig, ServerDescriptor, ToolRegistry};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{header_uuid, require_owner};
use crate::chat::driver::{self, TurnContext};
use crate::chat::events::TurnEvent;
use crate::chat::store::ChatStore;
use crate::chat::system_prompt;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;
use parley_core::chat::ConversationMessage;

#[derive(Debug, Deserialize, ToSchema)]
pub struct TurnRequest {
    /// Full conversation so far, client-authoritative.
    pub messages: Vec<ConversationMessage>,
    /// Tool servers to connect for this turn.
    #[serde(default, alias = "mcpServers")]
    pub mcp_servers: Vec<ServerDescriptor>,
    /// Catalog model id; falls back to `x-selected-model`, then the default.
    pub model: Option<String>,
    #[serde(alias = "chatId")]
    pub chat_id: Option<Uuid>,
    #[serde(alias = "userId")]
    pub user_id: Option<Uuid>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/chat", post(run_chat_turn))
}

/// Run one turn against the selected model with the requested tool servers.
///
/// The response is an SSE stream of turn events; the session id the turn
/// ran under (possibly freshly minted) comes back in the `x-chat-id` header
/// so the client can adopt it before the stream ends.
#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = TurnRequest,
    responses(
        (status = 200, description = "SSE stream of turn events"),
        (status = 400, description = "Validation or model-selection failure"),
        (status = 401, description = "No owner id on the request")
    ),
    tag = "chat"
)]
pub async fn run_chat_turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(body): AppJson<TurnRequest>,
) -> Result<impl IntoResponse, AppError> {
    if body.messages.is_empty() {
        return Err(AppError::Validation {
            message: "The turn needs at least one message".to_string(),
            field: Some("messages".to_string()),
            received: None,
            docs_hint: Some("Send the full conversation, ending with the new user message.".to_string()),
        });
    }

    let owner_id = require_owner(body.user_id, &headers)?;
    let model_id = body
        .model
        .or_else(|| {
            headers
                .get("x-selected-model")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| state.models.default_model().to_string());
    let (provider, model_info) = state.models.resolve(&model_id)?;
    let chat_id = body
        .chat_id
        .or(header_uuid(&headers, "x-chat-id")?)
        .unwrap_or_else(Uuid::now_v7);

    tracing::info!(
        %chat_id,
        model = model_info.id,
        servers = body.mcp_servers.len(),
        "turn started"
    );

    let store = ChatStore::new(state.db.clone());
    // Create the row up front so the session is listable while streaming.
    store.ensure_session(chat_id, owner_id).await?;

    let cancel = CancellationToken::new();
    // Armed from here on: if this future is dropped before the response
    // stream takes ownership (client gone while connecting, say), the token
    // still fires and the pool's registered teardown runs.
    let cancel_guard = cancel.clone().drop_guard();
    let pool_config = PoolConfig {
        connect_timeout: state.turn.connect_timeout,
    };
    let (pool, failures) =
        ClientPool::open(body.mcp_servers, &pool_config, cancel.clone()).await;
    if !failures.is_empty() {
        tracing::warn!(
            %chat_id,
            skipped = failures.len(),
            "some tool servers did not connect"
        );
    }
    let registry = ToolRegistry::merge(pool.servers()).await;

    let ctx = TurnContext {
        chat_id,
        owner_id,
        provider,
        model: model_info.api_version.to_string(),
        system: system_prompt(),
        transcript: body.messages,
        registry,
        pool,
        sink: Arc::new(store),
        max_steps: state.turn.max_steps,
        cancel: cancel.clone(),
    };

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(driver::run_turn(ctx, tx));

    let stream = TurnEventStream {
        inner: ReceiverStream::new(rx),
        _guard: cancel_guard,
    };
    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    Ok(([("x-chat-id", chat_id.to_string())], sse))
}

/// The SSE body. Carries the turn's cancellation guard, so dropping the
/// response (client disconnect included) cancels the turn.
struct TurnEventStream {
    inner: ReceiverStream<TurnEvent>,
    _guard: DropGuard,
}

impl Stream for TurnEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_next(cx)
            .map(|event| event.map(|event| Ok(encode_event(&event))))
    }
}

fn encode_event(event: &TurnEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        // TurnEvent serialization cannot fail; keep the stream alive anyway.
        Err(error) => {
            Event::default().data(error_frame(&format!("event encoding failed: {error}")))
        }
    }
}

fn error_frame(message: &str) -> String {
    serde_json::json!({"type": "error", "message": message}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_accepts_snake_and_camel_case_fields() {
        let snake: TurnRequest = serde_json::from_value(json!({
            "messages": [{"id": "m1", "role": "user", "parts": [{"type": "text", "text": "hi"}]}],
            "mcp_servers": [{"url": "https://tools.example/mcp", "kind": "http"}],
            "chat_id": "0191e7a8-0000-7000-8000-000000000000"
        }))
        .unwrap();
        assert_eq!(snake.mcp_servers.len(), 1);
        assert!(snake.chat_id.is_some());

        let camel: TurnRequest = serde_json::from_value(json!({
            "messages": [{"id": "m1", "role": "user", "parts": [{"type": "text", "text": "hi"}]}],
            "mcpServers": [{"url": "https://tools.example/sse", "type": "sse"}],
            "chatId": "0191e7a8-0000-7000-8000-000000000000"
        }))
        .unwrap();
        assert_eq!(camel.mcp_servers.len(), 1);
        assert!(camel.chat_id.is_some());
    }

    #[test]
    fn servers_default_to_empty() {
        let request: TurnRequest = serde_json::from_value(json!({
            "messages": [{"id": "m1", "role": "user", "parts": [{"type": "text", "text": "hi"}]}]
        }))
        .unwrap();
        assert!(request.mcp_servers.is_empty());
        assert!(request.model.is_none());
    }

    #[test]
    fn events_encode_as_sse_data_frames() {
        let event = encode_event(&TurnEvent::TextDelta {
            delta: "hi".to_string(),
        });
        let rendered = format!("{event:?}");
        assert!(rendered.contains("text-delta"));
    }

    #[test]
    fn fallback_error_frame_escapes_the_message() {
        let frame = error_frame(r#"bad "quoted" value"#);
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["message"], r#"bad "quoted" value"#);
    }

    #[tokio::test]
    async fn dropping_the_response_stream_cancels_the_turn() {
        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel::<TurnEvent>(1);
        let stream = TurnEventStream {
            inner: ReceiverStream::new(rx),
            _guard: cancel.clone().drop_guard(),
        };
        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
    }
}
