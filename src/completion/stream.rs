//! Streaming variant of the completion loop.
//!
//! The loop runs on its own task and pushes events into a bounded channel,
//! so a slow consumer holds the model stream back instead of losing events.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::replay::{visible_events, TurnBuffer};
use super::{record_answer, CompletionLoop, Conversation, LoopState, RunState};
use crate::config::CompletionOptions;
use crate::error::{CompletionError, InferenceError};
use crate::events::{StreamEvent, StreamEventKind};
use crate::memory::Memory;
use crate::tenant::TenantContext;
use crate::tools::{execute_tool_calls, LoopDetector};
use crate::types::{CompletionRequest, Message, Role};

/// Events of a streaming completion. Failures arrive as
/// [`StreamEventKind::Error`] events, after which the stream ends.
pub struct CompletionStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<()>,
}

impl CompletionStream {
    /// Wait for the driving task to finish, discarding unread events.
    pub async fn finish(mut self) {
        self.rx.close();
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "completion task ended abnormally");
        }
    }

    /// Concatenated text of every content delta until the stream ends, or
    /// the first error event.
    pub async fn text(mut self) -> Result<String, CompletionError> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event.kind {
                StreamEventKind::ContentDelta { text: delta, .. } => text.push_str(&delta),
                StreamEventKind::Error { message } => {
                    return Err(CompletionError::Inference(InferenceError::Stream(message)))
                }
                _ => {}
            }
        }
        Ok(text)
    }
}

impl Stream for CompletionStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl CompletionLoop {
    /// Start a streaming run. Invalid options and memory failures are
    /// reported here; everything after the first model call arrives as
    /// events.
    pub async fn run_stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<CompletionStream, CompletionError> {
        let tenant = TenantContext::resolve(options.organization.as_deref());
        let span = info_span!(
            "completion",
            org_id = %tenant.organization_id(),
            model = %self.model,
            stream = true
        );

        let conversation = self
            .prepare(prompt, options, true)
            .instrument(span.clone())
            .await?;
        let (tx, rx) = mpsc::channel(options.stream_buffer_size);
        let emitter = Emitter {
            tx,
            cancel: options.cancel.clone(),
        };
        let task = tokio::spawn(
            drive(self.clone(), conversation, options.clone(), emitter).instrument(span),
        );
        Ok(CompletionStream { rx, task })
    }
}

struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

/// Why an event could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    Closed,
}

impl Emitter {
    /// Queue one event, waiting for room unless the run is cancelled first.
    async fn emit(&self, event: StreamEvent) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| Halt::Closed),
        }
    }

    async fn emit_all(&self, events: Vec<StreamEvent>) -> Result<(), Halt> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }

    /// Queue the terminal event. Cancellation does not interrupt the wait,
    /// only a dropped consumer does.
    async fn terminate(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            warn!("consumer dropped the stream before its terminal event");
        }
    }

    async fn fail(&self, run: &mut RunState, error: CompletionError) {
        let error = run.fail(error);
        self.terminate(StreamEvent::error(error.to_string())).await;
    }

    /// Close out a run whose emission stopped.
    async fn halted(&self, run: &mut RunState, halt: Halt) {
        match halt {
            Halt::Cancelled => self.fail(run, CompletionError::Cancelled).await,
            Halt::Closed => {
                info!("consumer dropped the stream");
                run.enter(LoopState::Error);
            }
        }
    }
}

/// Whether an open stream should keep going.
enum TurnOutcome {
    Complete(TurnBuffer),
    Stopped,
}

async fn drive(
    engine: CompletionLoop,
    mut conversation: Conversation,
    options: CompletionOptions,
    out: Emitter,
) {
    let mut run = RunState::new();
    let registry = options.tools.clone().unwrap_or_default();
    let detector = LoopDetector::new();
    let memory = options.memory.as_deref();
    let cancel = &options.cancel;

    for iteration in 1..=options.max_tool_iterations {
        if cancel.is_cancelled() {
            info!(iteration, "streaming completion cancelled");
            out.fail(&mut run, CompletionError::Cancelled).await;
            return;
        }
        run.enter(LoopState::AwaitingModel);
        run.iterations = iteration;

        let request = conversation.request(true);
        let turn = match stream_turn(&engine, &request, options.show_intermediate, &out, &mut run).await {
            TurnOutcome::Complete(turn) => turn,
            TurnOutcome::Stopped => return,
        };

        let calls = turn.tool_calls();
        if !calls.is_empty() {
            run.enter(LoopState::HasToolCalls);
            info!(iteration, count = calls.len(), "executing tool calls");
            if !options.show_intermediate {
                if let Err(halt) = out.emit_all(visible_events(turn.events(), true)).await {
                    out.halted(&mut run, halt).await;
                    return;
                }
            }
            conversation.push(Message::blocks(Role::Assistant, turn.content_blocks()));
            let results = execute_tool_calls(&calls, &registry, &detector, memory).await;
            conversation.push(Message::tool_results(&results));
            continue;
        }

        let text = turn.text();
        if !text.trim().is_empty() {
            run.enter(LoopState::HasFinalContent);
            if !options.show_intermediate {
                if let Err(halt) = out.emit_all(visible_events(turn.events(), false)).await {
                    out.halted(&mut run, halt).await;
                    return;
                }
            }
            finish(&out, &mut run, memory, &text).await;
            return;
        }

        run.enter(LoopState::Empty);
        warn!(iteration, "model returned neither text nor tool calls");
    }

    run.enter(LoopState::MaxIterationsReached);
    if cancel.is_cancelled() {
        out.fail(&mut run, CompletionError::Cancelled).await;
        return;
    }
    run.enter(LoopState::FinalSynthesisCall);
    info!(
        iterations = options.max_tool_iterations,
        "iteration budget spent, requesting final answer"
    );

    // Known to be final, so it streams live.
    let request = conversation.synthesis_request();
    if let TurnOutcome::Complete(turn) = stream_turn(&engine, &request, true, &out, &mut run).await {
        finish(&out, &mut run, memory, &turn.text()).await;
    }
}

/// Stream one model call into a [`TurnBuffer`], forwarding events live
/// when `live` is set. Error events end the run.
async fn stream_turn(
    engine: &CompletionLoop,
    request: &CompletionRequest,
    live: bool,
    out: &Emitter,
    run: &mut RunState,
) -> TurnOutcome {
    let mut events = match engine.provider.infer_stream(request, &out.cancel).await {
        Ok(events) => events,
        Err(InferenceError::Cancelled) => {
            out.fail(run, CompletionError::Cancelled).await;
            return TurnOutcome::Stopped;
        }
        Err(e) => {
            out.fail(run, CompletionError::Inference(e)).await;
            return TurnOutcome::Stopped;
        }
    };
    run.model_calls += 1;

    let mut turn = TurnBuffer::new();
    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(InferenceError::Cancelled) => {
                out.fail(run, CompletionError::Cancelled).await;
                return TurnOutcome::Stopped;
            }
            Err(e) => {
                out.fail(run, CompletionError::Inference(e)).await;
                return TurnOutcome::Stopped;
            }
        };
        if let StreamEventKind::Error { message } = &event.kind {
            warn!(error = %message, "service reported an error mid-stream");
            run.enter(LoopState::Error);
            out.terminate(event).await;
            return TurnOutcome::Stopped;
        }
        if live {
            if let Err(halt) = out.emit(event.clone()).await {
                out.halted(run, halt).await;
                return TurnOutcome::Stopped;
            }
        }
        turn.record(event);
    }
    run.usage.accumulate(turn.usage());
    TurnOutcome::Complete(turn)
}

async fn finish(out: &Emitter, run: &mut RunState, memory: Option<&dyn Memory>, text: &str) {
    if let Err(e) = record_answer(memory, text).await {
        out.fail(run, e).await;
        return;
    }
    run.enter(LoopState::Done);
    info!(
        model_calls = run.model_calls,
        input_tokens = run.usage.input_tokens,
        output_tokens = run.usage.output_tokens,
        "streaming completion finished"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::memory::ConversationBuffer;
    use crate::testing::{text_stream, tool_stream, CalculatorTool, MockProvider, Reply};
    use crate::tools::ToolRegistry;
    use crate::types::ToolDefinition;

    fn engine(provider: &Arc<MockProvider>) -> CompletionLoop {
        CompletionLoop::new(provider.clone(), "test-model")
    }

    fn calculator() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new().add(
            ToolDefinition::new("calculator", "Add two numbers", json!({"type": "object"})),
            CalculatorTool,
        ))
    }

    async fn collect(stream: CompletionStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    fn deltas(events: &[StreamEvent]) -> String {
        events.iter().filter_map(StreamEvent::content_text).collect()
    }

    #[tokio::test]
    async fn tool_turn_text_is_held_back() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_stream("toolu_1", "calculator", r#"{"a":1,"b":1}"#),
            text_stream(&["The answer ", "is 2."]),
        ]));
        let options = CompletionOptions::new().with_tools(calculator());
        let events = collect(engine(&provider).run_stream("1+1?", &options).await.unwrap()).await;

        assert!(matches!(events[0].kind, StreamEventKind::ToolUse { .. }));
        assert_eq!(deltas(&events), "The answer is 2.");
        assert!(!events.iter().any(StreamEvent::is_error));

        let requests = provider.requests().await;
        assert!(requests.iter().all(|r| r.stream));
        let history = &requests[1].messages;
        assert_eq!(history[1].text(), "Checking with a tool.");
        assert_eq!(history[2].role, crate::types::Role::Tool);
    }

    #[tokio::test]
    async fn intermediate_text_streams_when_requested() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_stream("toolu_1", "calculator", r#"{"a":1,"b":1}"#),
            text_stream(&["2"]),
        ]));
        let options = CompletionOptions::new()
            .with_tools(calculator())
            .with_intermediate(true);
        let text = engine(&provider)
            .run_stream("1+1?", &options)
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text, "Checking with a tool.2");
    }

    #[tokio::test]
    async fn synthesis_turn_streams_live_without_tools() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_stream("toolu_1", "calculator", r#"{"a":1,"b":1}"#),
            text_stream(&["wrap", " up"]),
        ]));
        let memory = Arc::new(ConversationBuffer::new());
        let options = CompletionOptions::new()
            .with_tools(calculator())
            .with_memory(memory.clone())
            .with_max_tool_iterations(1);
        let events = collect(engine(&provider).run_stream("go", &options).await.unwrap()).await;

        assert_eq!(deltas(&events), "wrap up");
        let requests = provider.requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[1].tools.is_empty());
        let stored = memory.messages().await.unwrap();
        assert_eq!(stored.last(), Some(&Message::assistant("wrap up")));
    }

    #[tokio::test]
    async fn error_event_ends_the_stream() {
        let provider = Arc::new(MockProvider::new(vec![Reply::Events(vec![
            Ok(StreamEvent::new(StreamEventKind::ContentDelta {
                index: 0,
                text: "partial".into(),
            })),
            Ok(StreamEvent::error("overloaded")),
            Ok(StreamEvent::new(StreamEventKind::ContentDelta {
                index: 0,
                text: "never".into(),
            })),
        ])]));
        let options = CompletionOptions::new().with_intermediate(true);
        let events = collect(engine(&provider).run_stream("hi", &options).await.unwrap()).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content_text(), Some("partial"));
        assert_eq!(events[1].kind, StreamEventKind::Error { message: "overloaded".into() });
    }

    #[tokio::test]
    async fn transport_failure_becomes_an_error_event() {
        let provider = Arc::new(MockProvider::new(vec![Reply::Fail(InferenceError::Api {
            status: 503,
            message: "unavailable".into(),
        })]));
        let stream = engine(&provider)
            .run_stream("hi", &CompletionOptions::new())
            .await
            .unwrap();
        let err = stream.text().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn cancelled_run_reports_cancellation() {
        let provider = Arc::new(MockProvider::new(vec![text_stream(&["unused"])]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = CompletionOptions::new().with_cancel(cancel);
        let events = collect(engine(&provider).run_stream("hi", &options).await.unwrap()).await;

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            StreamEventKind::Error { message: CompletionError::Cancelled.to_string() }
        );
        assert!(provider.requests().await.is_empty());
    }

    #[tokio::test]
    async fn small_buffer_delivers_everything_in_order() {
        let parts: Vec<String> = (0..50).map(|i| format!("{i},")).collect();
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let provider = Arc::new(MockProvider::new(vec![text_stream(&refs)]));
        let options = CompletionOptions::new().with_stream_buffer_size(1);

        let mut stream = engine(&provider).run_stream("count", &options).await.unwrap();
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if let Some(delta) = event.content_text() {
                text.push_str(delta);
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(text, parts.concat());
    }

    #[tokio::test]
    async fn cancelling_mid_stream_stops_delivery() {
        let parts: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let provider = Arc::new(MockProvider::new(vec![text_stream(&refs)]));
        let cancel = CancellationToken::new();
        let options = CompletionOptions::new()
            .with_stream_buffer_size(1)
            .with_intermediate(true)
            .with_cancel(cancel.clone());

        let mut stream = engine(&provider).run_stream("count", &options).await.unwrap();
        assert!(stream.next().await.is_some());
        cancel.cancel();
        let rest = collect(stream).await;

        assert!(deltas(&rest).len() < parts.concat().len());
        assert_eq!(rest.iter().filter(|e| e.is_error()).count(), 1);
        assert_eq!(
            rest.last().map(|e| &e.kind),
            Some(&StreamEventKind::Error { message: CompletionError::Cancelled.to_string() })
        );
    }

    #[tokio::test]
    async fn slow_consumer_still_receives_transport_failure() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_stream("toolu_1", "calculator", r#"{"a":1,"b":1}"#),
            Reply::Fail(InferenceError::Api {
                status: 503,
                message: "unavailable".into(),
            }),
        ]));
        let options = CompletionOptions::new()
            .with_tools(calculator())
            .with_stream_buffer_size(1);

        let stream = engine(&provider).run_stream("1+1?", &options).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let events = collect(stream).await;

        assert!(matches!(events[0].kind, StreamEventKind::ToolUse { .. }));
        let last = events.last().unwrap();
        assert!(last.is_error());
        assert!(matches!(&last.kind, StreamEventKind::Error { message } if message.contains("503")));
        assert_eq!(provider.requests().await.len(), 2);
    }

    struct FragileTool;

    #[async_trait::async_trait]
    impl crate::tools::ToolHandler for FragileTool {
        async fn call(&self, input: &serde_json::Value) -> Result<String, String> {
            if input.is_object() {
                panic!("handler bug");
            }
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn panicking_tool_does_not_end_the_stream() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_stream("toolu_1", "fragile", "{}"),
            text_stream(&["recovered"]),
        ]));
        let registry = Arc::new(ToolRegistry::new().add(
            ToolDefinition::new("fragile", "Always panics", json!({"type": "object"})),
            FragileTool,
        ));
        let options = CompletionOptions::new().with_tools(registry);
        let events = collect(engine(&provider).run_stream("go", &options).await.unwrap()).await;

        assert_eq!(deltas(&events), "recovered");
        assert!(!events.iter().any(StreamEvent::is_error));
        let requests = provider.requests().await;
        assert_eq!(requests.len(), 2);
        let expected = Message::tool_results(&[crate::types::ToolResult {
            call_id: "toolu_1".into(),
            name: "fragile".into(),
            content: "tool fragile panicked: handler bug".into(),
            is_error: true,
        }]);
        assert_eq!(requests[1].messages[2].content, expected.content);
    }

    #[tokio::test]
    async fn dropped_consumer_ends_the_task_quietly() {
        let parts: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let provider = Arc::new(MockProvider::new(vec![text_stream(&refs)]));
        let options = CompletionOptions::new()
            .with_stream_buffer_size(1)
            .with_intermediate(true);

        let mut stream = engine(&provider).run_stream("count", &options).await.unwrap();
        assert!(stream.next().await.is_some());
        tokio::time::timeout(std::time::Duration::from_secs(1), stream.finish())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_options_fail_before_streaming() {
        let provider = Arc::new(MockProvider::new(vec![]));
        let options = CompletionOptions::new().with_stream_buffer_size(0);
        let result = engine(&provider).run_stream("hi", &options).await;
        assert!(matches!(result, Err(CompletionError::InvalidRequest(_))));
    }
}
