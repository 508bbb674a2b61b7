//! The turn driver: the bounded model/tool-call loop at the center of a
//! streaming turn.
//!
//! Each step streams one model completion, routing text through the
//! reasoning extractor and the smoother. If the step requested tool calls
//! they are dispatched sequentially and their results appended to the
//! in-progress assistant message, then the loop re-invokes the model. A step
//! with no tool calls finishes the turn; so does exhausting the step budget.
//!
//! Every terminal path (finished, failed, aborted) runs the same epilogue:
//! close the tool-server pool, then reconcile the transcript best-effort.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use parley_core::chat::{ConversationMessage, MessagePart, Role};
use parley_mcp::{ClientPool, ToolRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::TurnEvent;
use super::reasoning::{ReasoningExtractor, Segment};
use super::smooth::StreamSmoother;
use super::store::TranscriptSink;
use crate::model::{ModelEvent, ModelProvider, StepRequest, ToolCallRequest};

/// Cap on a single tool result as stored and fed back to the model. A tool
/// that returns megabytes would otherwise blow up every later step's prompt.
pub const MAX_TOOL_RESULT_BYTES: usize = 16 * 1024;

/// Everything one turn needs, assembled by the route handler.
pub struct TurnContext {
    pub chat_id: Uuid,
    pub owner_id: Uuid,
    pub provider: Arc<dyn ModelProvider>,
    /// Provider-side model name.
    pub model: String,
    pub system: String,
    /// Prior transcript plus the just-received user messages.
    pub transcript: Vec<ConversationMessage>,
    pub registry: ToolRegistry,
    pub pool: ClientPool,
    pub sink: Arc<dyn TranscriptSink>,
    pub max_steps: usize,
    pub cancel: CancellationToken,
}

enum Outcome {
    Finished,
    Failed(String),
    Aborted,
}

/// Run one turn to completion, emitting wire events on `tx`. Consumes the
/// context; when this returns, the pool is closed and the transcript has
/// been offered to the sink.
pub async fn run_turn(mut ctx: TurnContext, tx: mpsc::Sender<TurnEvent>) {
    let assistant_id = Uuid::now_v7().to_string();
    let mut parts: Vec<MessagePart> = Vec::new();

    let outcome = drive_steps(&ctx, &assistant_id, &tx, &mut parts).await;

    if !parts.is_empty() {
        ctx.transcript.push(ConversationMessage {
            id: assistant_id,
            role: Role::Assistant,
            parts,
            created_at: Utc::now(),
        });
    }

    // Teardown before persistence: connections must not outlive the turn
    // even if the database write stalls.
    ctx.pool.close_all().await;

    if let Err(error) = ctx
        .sink
        .reconcile(ctx.chat_id, ctx.owner_id, &ctx.transcript)
        .await
    {
        tracing::error!(
            chat_id = %ctx.chat_id,
            error = %error,
            "transcript reconciliation failed"
        );
    }

    match outcome {
        Outcome::Finished => {
            let _ = tx.send(TurnEvent::Done).await;
        }
        Outcome::Failed(message) => {
            tracing::warn!(chat_id = %ctx.chat_id, message, "turn failed");
            let _ = tx.send(TurnEvent::Error { message }).await;
        }
        // The client is gone; nobody is listening for a terminal event.
        Outcome::Aborted => {}
    }
}

async fn drive_steps(
    ctx: &TurnContext,
    assistant_id: &str,
    tx: &mpsc::Sender<TurnEvent>,
    parts: &mut Vec<MessagePart>,
) -> Outcome {
    let tools = ctx.registry.descriptors();

    for step in 0..ctx.max_steps {
        let request = StepRequest {
            model: ctx.model.clone(),
            system: ctx.system.clone(),
            messages: with_partial_assistant(&ctx.transcript, assistant_id, parts),
            tools: tools.clone(),
        };
        let mut stream = match ctx.provider.stream_step(request).await {
            Ok(stream) => stream,
            Err(error) => return Outcome::Failed(error.to_string()),
        };

        let mut extractor = ReasoningExtractor::new();
        let mut smoother = StreamSmoother::default();
        let mut calls: Vec<ToolCallRequest> = Vec::new();

        loop {
            // A stalled model must not pin a partial line past its hold
            // window; the timer arm flushes it even with no delta arriving.
            let hold_deadline = smoother.deadline();
            let event = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Outcome::Aborted,
                _ = hold_expiry(hold_deadline), if hold_deadline.is_some() => {
                    flush_text(tx, parts, &mut smoother).await;
                    continue;
                }
                event = stream.next() => event,
            };
            match event {
                None => break,
                Some(Ok(ModelEvent::TextDelta(delta))) => {
                    for segment in extractor.push(&delta) {
                        emit_segment(tx, parts, &mut smoother, segment).await;
                    }
                }
                Some(Ok(ModelEvent::ToolCall(call))) => calls.push(call),
                Some(Err(error)) => {
                    flush_text(tx, parts, &mut smoother).await;
                    return Outcome::Failed(error.to_string());
                }
            }
        }

        for segment in extractor.finish() {
            emit_segment(tx, parts, &mut smoother, segment).await;
        }
        flush_text(tx, parts, &mut smoother).await;

        if calls.is_empty() {
            return Outcome::Finished;
        }
        tracing::debug!(step, calls = calls.len(), "dispatching tool calls");

        for call in calls {
            let _ = tx
                .send(TurnEvent::ToolCall {
                    tool_name: call.name.clone(),
                    args: call.args.clone(),
                    call_id: call.call_id.clone(),
                })
                .await;
            parts.push(MessagePart::ToolCall {
                tool_name: call.name.clone(),
                args: call.args.clone(),
                call_id: call.call_id.clone(),
            });

            let dispatched = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    // Close the dangling call so the stored transcript stays
                    // replayable on the wire.
                    parts.push(MessagePart::ToolResult {
                        call_id: call.call_id,
                        result: None,
                        error: Some("turn aborted".to_string()),
                    });
                    return Outcome::Aborted;
                }
                dispatched = ctx.registry.call(&call.name, call.args.clone()) => dispatched,
            };

            let (result, error) = match dispatched {
                Ok(outcome) if outcome.is_error => (None, Some(clip(&outcome.text()))),
                Ok(outcome) => (Some(clip_value(outcome.flattened())), None),
                Err(error) => (None, Some(error.to_string())),
            };
            let _ = tx
                .send(TurnEvent::ToolResult {
                    call_id: call.call_id.clone(),
                    result: result.clone(),
                    error: error.clone(),
                })
                .await;
            parts.push(MessagePart::ToolResult {
                call_id: call.call_id,
                result,
                error,
            });
        }
    }

    tracing::warn!(max_steps = ctx.max_steps, "step budget exhausted, finishing turn");
    Outcome::Finished
}

async fn hold_expiry(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// The transcript as the model should see it mid-turn: prior messages plus
/// the assistant message under construction, if anything is in it yet.
fn with_partial_assistant(
    transcript: &[ConversationMessage],
    assistant_id: &str,
    parts: &[MessagePart],
) -> Vec<ConversationMessage> {
    let mut messages = transcript.to_vec();
    if !parts.is_empty() {
        messages.push(ConversationMessage {
            id: assistant_id.to_string(),
            role: Role::Assistant,
            parts: parts.to_vec(),
            created_at: Utc::now(),
        });
    }
    messages
}

async fn emit_segment(
    tx: &mpsc::Sender<TurnEvent>,
    parts: &mut Vec<MessagePart>,
    smoother: &mut StreamSmoother,
    segment: Segment,
) {
    match segment {
        Segment::Text(text) => {
            for chunk in smoother.push(&text, Instant::now()) {
                append_text(parts, &chunk);
                let _ = tx.send(TurnEvent::TextDelta { delta: chunk }).await;
            }
        }
        Segment::Reasoning(text) => {
            // Held answer text must go out first to preserve emission order.
            flush_text(tx, parts, smoother).await;
            append_reasoning(parts, &text);
            let _ = tx.send(TurnEvent::ReasoningDelta { delta: text }).await;
        }
    }
}

async fn flush_text(
    tx: &mpsc::Sender<TurnEvent>,
    parts: &mut Vec<MessagePart>,
    smoother: &mut StreamSmoother,
) {
    if let Some(chunk) = smoother.flush() {
        append_text(parts, &chunk);
        let _ = tx.send(TurnEvent::TextDelta { delta: chunk }).await;
    }
}

fn append_text(parts: &mut Vec<MessagePart>, chunk: &str) {
    if let Some(MessagePart::Text { text }) = parts.last_mut() {
        text.push_str(chunk);
    } else {
        parts.push(MessagePart::Text {
            text: chunk.to_string(),
        });
    }
}

fn append_reasoning(parts: &mut Vec<MessagePart>, chunk: &str) {
    if let Some(MessagePart::Reasoning { text }) = parts.last_mut() {
        text.push_str(chunk);
    } else {
        parts.push(MessagePart::Reasoning {
            text: chunk.to_string(),
        });
    }
}

fn clip_value(value: serde_json::Value) -> serde_json::Value {
    let encoded = value.to_string();
    if encoded.len() <= MAX_TOOL_RESULT_BYTES {
        value
    } else {
        serde_json::Value::String(clip(&encoded))
    }
}

fn clip(text: &str) -> String {
    if text.len() <= MAX_TOOL_RESULT_BYTES {
        return text.to_string();
    }
    let mut end = MAX_TOOL_RESULT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} [truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::store::StoreError;
    use crate::model::{ModelError, ModelStream};
    use async_trait::async_trait;
    use parley_mcp::{McpError, ToolDescriptor, ToolOutcome, ToolServer};
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that plays back scripted steps.
    struct ScriptedModel {
        steps: Mutex<VecDeque<Vec<Result<ModelEvent, ModelError>>>>,
        invocations: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(steps: Vec<Vec<Result<ModelEvent, ModelError>>>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                invocations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn stream_step(&self, _request: StepRequest) -> Result<ModelStream, ModelError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let step = self
                .steps
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_default();
            Ok(Box::pin(futures_util::stream::iter(step)))
        }
    }

    struct RecordingSink {
        reconciled: Mutex<Vec<Vec<ConversationMessage>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                reconciled: Mutex::new(Vec::new()),
            }
        }

        fn last(&self) -> Vec<ConversationMessage> {
            self.reconciled
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .last()
                .cloned()
                .expect("no reconciliation recorded")
        }
    }

    #[async_trait]
    impl TranscriptSink for RecordingSink {
        async fn reconcile(
            &self,
            _chat_id: Uuid,
            _owner_id: Uuid,
            messages: &[ConversationMessage],
        ) -> Result<(), StoreError> {
            self.reconciled
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(messages.to_vec());
            Ok(())
        }
    }

    struct EchoTool {
        label: String,
        close_count: Arc<AtomicUsize>,
    }

    impl EchoTool {
        fn new(label: &str) -> Self {
            Self {
                label: label.to_string(),
                close_count: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ToolServer for EchoTool {
        fn label(&self) -> &str {
            &self.label
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
            Ok(vec![ToolDescriptor {
                name: "echo".to_string(),
                description: "echoes its arguments".to_string(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, _name: &str, args: Value) -> Result<ToolOutcome, McpError> {
            Ok(ToolOutcome {
                content: json!([{"type": "text", "text": args.to_string()}]),
                is_error: false,
            })
        }

        async fn close(&self) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn user_message(text: &str) -> ConversationMessage {
        ConversationMessage {
            id: "u1".to_string(),
            role: Role::User,
            parts: vec![MessagePart::Text {
                text: text.to_string(),
            }],
            created_at: Utc::now(),
        }
    }

    fn text_delta(s: &str) -> Result<ModelEvent, ModelError> {
        Ok(ModelEvent::TextDelta(s.to_string()))
    }

    fn tool_call(id: &str, name: &str) -> Result<ModelEvent, ModelError> {
        Ok(ModelEvent::ToolCall(ToolCallRequest {
            call_id: id.to_string(),
            name: name.to_string(),
            args: json!({"payload": 1}),
        }))
    }

    async fn run(
        provider: Arc<ScriptedModel>,
        servers: Vec<Arc<dyn ToolServer>>,
        sink: Arc<RecordingSink>,
        max_steps: usize,
        cancel: CancellationToken,
    ) -> Vec<TurnEvent> {
        let pool = ClientPool::from_servers(servers);
        let registry = ToolRegistry::merge(pool.servers()).await;
        let ctx = TurnContext {
            chat_id: Uuid::now_v7(),
            owner_id: Uuid::now_v7(),
            provider,
            model: "test-model".to_string(),
            system: "test system".to_string(),
            transcript: vec![user_message("hi")],
            registry,
            pool,
            sink,
            max_steps,
            cancel,
        };
        let (tx, mut rx) = mpsc::channel(64);
        let task = tokio::spawn(run_turn(ctx, tx));
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        task.await.unwrap();
        events
    }

    #[tokio::test]
    async fn text_only_turn_streams_deltas_then_done() {
        let provider = Arc::new(ScriptedModel::new(vec![vec![
            text_delta("Hello "),
            text_delta("world\n"),
        ]]));
        let sink = Arc::new(RecordingSink::new());
        let events = run(
            provider.clone(),
            Vec::new(),
            sink.clone(),
            8,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(events.last(), Some(&TurnEvent::Done));
        let text: String = events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello world\n");
        assert_eq!(provider.invocations.load(Ordering::SeqCst), 1);

        let transcript = sink.last();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].role, Role::Assistant);
        assert_eq!(transcript[1].text_content(), "Hello world\n");
    }

    #[tokio::test]
    async fn reasoning_stays_out_of_the_answer_stream() {
        let provider = Arc::new(ScriptedModel::new(vec![vec![
            text_delta("<think>weighing options</think>"),
            text_delta("the answer\n"),
        ]]));
        let sink = Arc::new(RecordingSink::new());
        let events = run(
            provider,
            Vec::new(),
            sink.clone(),
            8,
            CancellationToken::new(),
        )
        .await;

        assert!(events.contains(&TurnEvent::ReasoningDelta {
            delta: "weighing options".to_string()
        }));
        let answer: String = events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(answer, "the answer\n");

        let parts = &sink.last()[1].parts;
        assert!(matches!(parts[0], MessagePart::Reasoning { .. }));
        assert!(matches!(parts[1], MessagePart::Text { .. }));
    }

    #[tokio::test]
    async fn tool_call_round_trip_feeds_the_next_step() {
        let provider = Arc::new(ScriptedModel::new(vec![
            vec![tool_call("call_1", "echo")],
            vec![text_delta("used the tool\n")],
        ]));
        let sink = Arc::new(RecordingSink::new());
        let tool = EchoTool::new("srv");
        let closes = tool.close_count.clone();
        let events = run(
            provider.clone(),
            vec![Arc::new(tool)],
            sink.clone(),
            8,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(provider.invocations.load(Ordering::SeqCst), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(events.last(), Some(&TurnEvent::Done));

        let kinds: Vec<&str> = events
            .iter()
            .map(|event| match event {
                TurnEvent::ToolCall { .. } => "tool-call",
                TurnEvent::ToolResult { .. } => "tool-result",
                TurnEvent::TextDelta { .. } => "text",
                TurnEvent::Done => "done",
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec!["tool-call", "tool-result", "text", "done"]);

        // The assistant message interleaves parts in emission order.
        let parts = &sink.last()[1].parts;
        assert!(matches!(parts[0], MessagePart::ToolCall { .. }));
        assert!(
            matches!(&parts[1], MessagePart::ToolResult { result: Some(_), error: None, .. })
        );
        assert!(matches!(parts[2], MessagePart::Text { .. }));
    }

    #[tokio::test]
    async fn step_budget_bounds_the_loop() {
        // Every step asks for another tool call; the loop must stop anyway.
        let steps = (0..10)
            .map(|i| vec![tool_call(&format!("call_{i}"), "echo")])
            .collect();
        let provider = Arc::new(ScriptedModel::new(steps));
        let sink = Arc::new(RecordingSink::new());
        let tool = EchoTool::new("srv");
        let closes = tool.close_count.clone();
        let events = run(
            provider.clone(),
            vec![Arc::new(tool)],
            sink,
            3,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(provider.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(events.last(), Some(&TurnEvent::Done));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_partial_line_is_flushed_without_waiting_for_the_next_delta() {
        use std::time::Duration;

        /// Emits a partial line, stalls well past the hold window, then
        /// finishes the line.
        struct StallingModel;

        #[async_trait]
        impl ModelProvider for StallingModel {
            async fn stream_step(
                &self,
                _request: StepRequest,
            ) -> Result<ModelStream, ModelError> {
                let stream = async_stream::stream! {
                    yield Ok(ModelEvent::TextDelta("half line".to_string()));
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    yield Ok(ModelEvent::TextDelta(" end\n".to_string()));
                };
                Ok(Box::pin(stream))
            }
        }

        let sink = Arc::new(RecordingSink::new());
        let pool = ClientPool::from_servers(Vec::new());
        let registry = ToolRegistry::merge(pool.servers()).await;
        let ctx = TurnContext {
            chat_id: Uuid::now_v7(),
            owner_id: Uuid::now_v7(),
            provider: Arc::new(StallingModel),
            model: "test-model".to_string(),
            system: "test system".to_string(),
            transcript: vec![user_message("hi")],
            registry,
            pool,
            sink: sink.clone(),
            max_steps: 8,
            cancel: CancellationToken::new(),
        };
        let (tx, mut rx) = mpsc::channel(64);
        let task = tokio::spawn(run_turn(ctx, tx));
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        task.await.unwrap();

        // Without the timer the two fragments would coalesce into one delta
        // at the newline; the stall forces "half line" out on its own.
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["half line", " end\n"]);
        assert_eq!(sink.last()[1].text_content(), "half line end\n");
    }

    #[tokio::test]
    async fn unknown_tool_error_is_fed_back_not_fatal() {
        let provider = Arc::new(ScriptedModel::new(vec![
            vec![tool_call("call_1", "missing")],
            vec![text_delta("recovered\n")],
        ]));
        let sink = Arc::new(RecordingSink::new());
        let events = run(
            provider,
            Vec::new(),
            sink.clone(),
            8,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(events.last(), Some(&TurnEvent::Done));
        let parts = &sink.last()[1].parts;
        assert!(
            matches!(&parts[1], MessagePart::ToolResult { result: None, error: Some(_), .. })
        );
    }

    #[tokio::test]
    async fn model_error_surfaces_after_teardown_and_persist() {
        let provider = Arc::new(ScriptedModel::new(vec![vec![
            text_delta("partial"),
            Err(ModelError::Stream("connection reset".to_string())),
        ]]));
        let sink = Arc::new(RecordingSink::new());
        let tool = EchoTool::new("srv");
        let closes = tool.close_count.clone();
        let events = run(
            provider,
            vec![Arc::new(tool)],
            sink.clone(),
            8,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(events.last(), Some(TurnEvent::Error { .. })));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        // The partial answer text survives into the transcript.
        assert_eq!(sink.last()[1].text_content(), "partial");
    }

    #[tokio::test]
    async fn cancelled_turn_ends_without_terminal_event() {
        let provider = Arc::new(ScriptedModel::new(vec![vec![text_delta("never seen")]]));
        let sink = Arc::new(RecordingSink::new());
        let tool = EchoTool::new("srv");
        let closes = tool.close_count.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events = run(provider, vec![Arc::new(tool)], sink.clone(), 8, cancel).await;

        assert!(events.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        // Persistence still ran, with just the user message.
        assert_eq!(sink.last().len(), 1);
    }

    #[test]
    fn oversized_tool_results_are_clipped() {
        let big = "x".repeat(MAX_TOOL_RESULT_BYTES + 100);
        let clipped = clip_value(Value::String(big));
        let text = clipped.as_str().unwrap();
        assert!(text.len() < MAX_TOOL_RESULT_BYTES + 64);
        assert!(text.ends_with("[truncated]"));

        let small = json!({"ok": true});
        assert_eq!(clip_value(small.clone()), small);
    }
}
