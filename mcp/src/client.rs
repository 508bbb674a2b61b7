//! JSON-RPC 2.0 client for MCP tool servers.
//!
//! Speaks the subset of the protocol a turn needs: `initialize`,
//! `tools/list`, and `tools/call`. Both transport kinds POST requests to the
//! server's endpoint; an `sse` server answers on a `text/event-stream` body
//! instead of plain JSON, so responses are scanned out of the event stream
//! by request id.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::transport::ConnectionRecipe;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "parley";
const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("cancelled")]
    Cancelled,
}

/// One tool advertised by a server's `tools/list`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Result of a `tools/call`: the content array plus the server's error flag.
/// An `is_error` outcome is still a successful call at this layer — it
/// becomes an error tool-result part, fed back to the model.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    /// Collapse the content array into something a transcript can hold:
    /// a single text item is returned as parsed JSON when it parses, the
    /// raw string otherwise; anything else keeps the array shape.
    pub fn flattened(&self) -> Value {
        let Some(items) = self.content.as_array() else {
            return self.content.clone();
        };
        let texts: Vec<&str> = items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if texts.len() == items.len() && !texts.is_empty() {
            let joined = texts.join("\n");
            return serde_json::from_str(&joined).unwrap_or(Value::String(joined));
        }
        self.content.clone()
    }

    /// Plain-text rendering, used for error payloads.
    pub fn text(&self) -> String {
        match self.flattened() {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }
}

/// Seam between the orchestration layer and a live tool server. The HTTP
/// client below is the production implementation; tests substitute stubs.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Display label for logs (the server url in practice).
    fn label(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError>;
    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome, McpError>;
    /// Release the connection. Idempotence is enforced one level up, in the
    /// pool's single-fire guard; calling this twice is still harmless.
    async fn close(&self);
}

/// A live connection to one MCP server. Owns exactly one transport; owned
/// exclusively by the turn's [`crate::ClientPool`].
pub struct McpClient {
    recipe: ConnectionRecipe,
    http: reqwest::Client,
    next_id: AtomicI64,
    session: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl McpClient {
    /// Open a connection: build the HTTP client, run the `initialize`
    /// handshake, and acknowledge it.
    pub async fn connect(recipe: ConnectionRecipe) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        let client = Self {
            recipe,
            http,
            next_id: AtomicI64::new(1),
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        let init = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        tracing::debug!(
            server = %client.recipe.url,
            info = ?init.get("serverInfo"),
            "mcp handshake complete"
        );
        client.notify("notifications/initialized").await?;
        Ok(client)
    }

    fn build_post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.recipe.url)
            .header("accept", "application/json, text/event-stream")
            .json(body);
        for (name, value) in &self.recipe.headers {
            req = req.header(name, value);
        }
        if let Some(session) = self.session.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    /// Send one JSON-RPC request and wait for its response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Protocol("client is closed".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self.build_post(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.to_string());
        }

        let is_event_stream = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let response = if is_event_stream {
            read_sse_response(resp, id).await?
        } else {
            resp.json::<Value>().await?
        };
        unwrap_rpc_response(response, id)
    }

    /// Send a JSON-RPC notification (no id, no response expected).
    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        let resp = self.build_post(&body).send().await?;
        // Servers answer notifications with 202/204 and an empty body.
        if !resp.status().is_success() {
            tracing::debug!(
                server = %self.recipe.url,
                status = resp.status().as_u16(),
                method,
                "notification rejected"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ToolServer for McpClient {
    fn label(&self) -> &str {
        &self.recipe.url
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| McpError::Protocol("tools/list result missing 'tools'".to_string()))?;
        serde_json::from_value(tools)
            .map_err(|e| McpError::Protocol(format!("malformed tool descriptor: {e}")))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome, McpError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": args }))
            .await?;
        let content = result.get("content").cloned().unwrap_or(Value::Null);
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(ToolOutcome { content, is_error })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Streamable-HTTP sessions are released with a DELETE; best-effort.
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(session) = session {
            let mut req = self.http.delete(&self.recipe.url).header(SESSION_HEADER, session);
            for (name, value) in &self.recipe.headers {
                req = req.header(name, value);
            }
            if let Err(e) = req.send().await {
                tracing::debug!(server = %self.recipe.url, error = %e, "session release failed");
            }
        }
        tracing::debug!(server = %self.recipe.url, "mcp client closed");
    }
}

/// Pull the `result` out of a JSON-RPC response envelope, or surface its
/// error object.
fn unwrap_rpc_response(response: Value, expected_id: i64) -> Result<Value, McpError> {
    let Some(obj) = response.as_object() else {
        return Err(McpError::Protocol("response is not a JSON object".to_string()));
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(McpError::Protocol("response missing jsonrpc version".to_string()));
    }
    if obj.get("id").and_then(Value::as_i64) != Some(expected_id) {
        return Err(McpError::Protocol(format!(
            "response id does not match request id {expected_id}"
        )));
    }
    if let Some(error) = obj.get("error") {
        return Err(McpError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown server error")
                .to_string(),
        });
    }
    obj.get("result")
        .cloned()
        .ok_or_else(|| McpError::Protocol("response has neither result nor error".to_string()))
}

/// Incremental SSE scanner: buffers body bytes, splits on blank-line event
/// boundaries, and yields the first JSON-RPC message whose id matches.
struct SseResponseScanner {
    buffer: String,
    expected_id: i64,
}

impl SseResponseScanner {
    fn new(expected_id: i64) -> Self {
        Self {
            buffer: String::new(),
            expected_id,
        }
    }

    fn push(&mut self, chunk: &str) -> Option<Value> {
        self.buffer.push_str(chunk);
        while let Some(boundary) = self.buffer.find("\n\n") {
            let event = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);
            if let Some(message) = self.scan_event(&event) {
                return Some(message);
            }
        }
        None
    }

    fn scan_event(&self, event: &str) -> Option<Value> {
        let mut data = String::new();
        for line in event.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data.push_str(rest.trim_start());
            }
        }
        if data.is_empty() {
            return None;
        }
        let message: Value = serde_json::from_str(&data).ok()?;
        (message.get("id").and_then(Value::as_i64) == Some(self.expected_id)).then_some(message)
    }
}

async fn read_sse_response(resp: reqwest::Response, expected_id: i64) -> Result<Value, McpError> {
    let mut scanner = SseResponseScanner::new(expected_id);
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let bytes = chunk?;
        if let Some(message) = scanner.push(&String::from_utf8_lossy(&bytes)) {
            return Ok(message);
        }
    }
    Err(McpError::Protocol(
        "event stream ended before the response arrived".to_string(),
    ))
}
