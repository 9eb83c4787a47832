//! The ReAct state machine: `Init → CallLLM → EvaluateResponse →
//! (TerminalAnswer | ExecuteTools) → CallLLM …`, bounded to `maxToolCalls + 1`
//! LLM rounds. Batch and streaming share the same transitions; streaming
//! additionally forwards text deltas and `tool_start`/`tool_end` markers as
//! they happen instead of returning everything at once.
//!
//! Retrying a failed LLM call and gating it behind the circuit breaker is
//! not this module's job — the caller hands in an already-composed
//! [`LlmCaller`]/[`LlmStreamer`] closure (built in `lifecycle.rs` around
//! [`crate::retry::retry_with_backoff_conditional`] and
//! [`crate::breaker::CircuitBreaker`]); this engine just calls it once per
//! round and propagates whatever it returns.

use crate::capabilities::{ChatChunk, ChatResponse, ChatStream};
use crate::concurrency::CancellationToken;
use crate::error::{Error, Result};
use crate::hooks::HookContext;
use crate::markers::Marker;
use crate::orchestrator::ToolCallOrchestrator;
use crate::types::{Message, TokenUsage, ToolCall};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// One batch `CallLLM` step, already wrapped (by the caller) in retry +
/// circuit breaker. `tools_enabled=false` must make the closure omit its
/// tool schema from the request, so the model physically cannot request a
/// tool call for that round.
pub type LlmCaller =
    Arc<dyn Fn(Vec<Message>, bool) -> Pin<Box<dyn Future<Output = Result<ChatResponse>> + Send>> + Send + Sync>;

/// One streaming `CallLLM` step. Stream creation itself isn't retried (only
/// the call that produces it, per spec — stream *consumption* is not
/// wrapped), so this returns the stream directly rather than a `Result`.
pub type LlmStreamer = Arc<dyn Fn(Vec<Message>, bool) -> ChatStream + Send + Sync>;

fn history_to_json(history: &[Message]) -> Vec<Value> {
    history.iter().map(|m| serde_json::to_value(m).unwrap_or(Value::Null)).collect()
}

/// Outcome of a completed batch ReAct run: the final answer, the trimmed
/// set of tools that actually ran, and the history as it stands after the
/// last round (assistant/tool pairs included).
#[derive(Debug, Clone)]
pub struct ReactOutcome {
    pub content: String,
    pub tools_used: Vec<String>,
    pub history: Vec<Message>,
    pub token_usage: Option<TokenUsage>,
    pub llm_calls: u32,
}

/// Accumulated result of a streaming run, filled in once the stream this
/// engine returns has been fully drained. Token usage is never populated
/// here — known streaming gap (spec).
#[derive(Debug, Clone, Default)]
pub struct StreamRunSummary {
    pub success: bool,
    pub tools_used: Vec<String>,
    pub final_content: String,
    pub llm_calls: u32,
    pub error_message: Option<String>,
    /// History as it stood at the point the run terminated — empty on error,
    /// since a failed run has nothing safe to persist.
    pub history: Vec<Message>,
}

pub struct ReactEngine {
    orchestrator: Arc<ToolCallOrchestrator>,
}

impl ReactEngine {
    pub fn new(orchestrator: Arc<ToolCallOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Run the bounded batch loop. `history` is the conversation so far
    /// (not including the active user prompt's reply, which this loop
    /// produces). Returns once a terminal answer is reached or an error
    /// occurs; `call_llm` errors (retry/breaker exhausted, or cancellation)
    /// propagate unchanged.
    pub async fn run_batch(
        &self,
        mut history: Vec<Message>,
        max_tool_calls: u32,
        allowlist: &[String],
        ctx: &HookContext,
        cancellation: &CancellationToken,
        call_llm: &LlmCaller,
    ) -> Result<ReactOutcome> {
        let call_counter = Arc::new(AtomicU32::new(0));
        let mut tools_enabled = true;
        let mut tools_used = Vec::new();
        let mut llm_calls = 0u32;

        loop {
            cancellation.check()?;
            llm_calls += 1;
            let response = call_llm(history.clone(), tools_enabled).await?;

            if tools_enabled && !response.tool_calls.is_empty() {
                history.push(Message::assistant_with_tool_calls(response.content.clone(), response.tool_calls.clone()));

                let history_json = history_to_json(&history);
                let outcomes = self
                    .orchestrator
                    .execute_batch(&response.tool_calls, ctx, &history_json, allowlist, &call_counter, max_tool_calls, cancellation)
                    .await?;

                for outcome in outcomes {
                    history.push(Message::tool(outcome.tool_call_id, outcome.content));
                    if outcome.invoked {
                        tools_used.push(outcome.tool_name);
                    }
                }

                if call_counter.load(Ordering::SeqCst) >= max_tool_calls {
                    tools_enabled = false;
                }
                continue;
            }

            if response.content.is_empty() && response.tool_calls.is_empty() {
                return Err(Error::invalid_input("model returned empty content and no tool calls"));
            }

            history.push(Message::assistant(response.content.clone()));
            return Ok(ReactOutcome {
                content: response.content,
                tools_used,
                history,
                token_usage: response.usage,
                llm_calls,
            });
        }
    }

    /// Run the same state machine in streaming mode. Returns a lazily-driven
    /// sequence of [`StreamChunk`]-shaped output ([`Marker`]s for control
    /// events, plain `String`s for text deltas) plus a handle to the run
    /// summary, written once when the stream reaches a terminal state.
    /// Callers must drain the stream to completion to observe the summary.
    pub fn run_stream(
        &self,
        history: Vec<Message>,
        max_tool_calls: u32,
        allowlist: Vec<String>,
        ctx: HookContext,
        cancellation: CancellationToken,
        call_llm_stream: LlmStreamer,
    ) -> (impl Stream<Item = crate::markers::StreamChunk>, Arc<Mutex<StreamRunSummary>>) {
        let summary = Arc::new(Mutex::new(StreamRunSummary::default()));
        let summary_handle = summary.clone();
        let orchestrator = self.orchestrator.clone();

        let state = RoundState {
            history,
            tools_enabled: true,
            call_counter: Arc::new(AtomicU32::new(0)),
            max_tool_calls,
            allowlist,
            ctx,
            cancellation,
            orchestrator,
            call_llm_stream,
            queue: VecDeque::new(),
            inner: None,
            accumulated_text: String::new(),
            llm_calls: 0,
            tools_used: Vec::new(),
            finished: false,
            summary,
        };

        let stream = futures::stream::unfold(state, move |mut state| async move {
            loop {
                if let Some(chunk) = state.queue.pop_front() {
                    return Some((chunk, state));
                }
                if state.finished {
                    return None;
                }
                if state.cancellation.is_cancelled() {
                    state.finish_with_error("Operation cancelled".to_string());
                    continue;
                }

                let Some(mut inner) = state.inner.take() else {
                    state.llm_calls += 1;
                    state.accumulated_text.clear();
                    state.inner = Some((state.call_llm_stream)(state.history.clone(), state.tools_enabled));
                    continue;
                };

                // Race the upstream read against cancellation so a stalled
                // SSE connection is torn down promptly instead of only on
                // the next queue-drain iteration.
                let next = tokio::select! {
                    biased;
                    _ = crate::concurrency::wait_for_cancellation(&state.cancellation) => None,
                    next = inner.next() => Some(next),
                };

                let Some(next) = next else {
                    // `inner` is dropped here, tearing down the upstream stream.
                    state.inner = None;
                    state.finish_with_error("Operation cancelled".to_string());
                    continue;
                };

                match next {
                    Some(Ok(ChatChunk::Content(text))) => {
                        state.accumulated_text.push_str(&text);
                        state.queue.push_back(crate::markers::StreamChunk::Text(text));
                        state.inner = Some(inner);
                    }
                    Some(Ok(ChatChunk::Finished { tool_calls })) => {
                        state.handle_round_end(tool_calls).await;
                    }
                    Some(Err(err)) => {
                        state.finish_with_error(err.to_string());
                    }
                    None => {
                        // Upstream ended without an explicit Finished chunk.
                        state.handle_round_end(Vec::new()).await;
                    }
                }
            }
        });

        (stream, summary_handle)
    }
}

struct RoundState {
    history: Vec<Message>,
    tools_enabled: bool,
    call_counter: Arc<AtomicU32>,
    max_tool_calls: u32,
    allowlist: Vec<String>,
    ctx: HookContext,
    cancellation: CancellationToken,
    orchestrator: Arc<ToolCallOrchestrator>,
    call_llm_stream: LlmStreamer,
    queue: VecDeque<crate::markers::StreamChunk>,
    inner: Option<ChatStream>,
    accumulated_text: String,
    llm_calls: u32,
    tools_used: Vec<String>,
    finished: bool,
    summary: Arc<Mutex<StreamRunSummary>>,
}

impl RoundState {
    fn finish_with_error(&mut self, message: String) {
        self.queue.push_back(crate::markers::StreamChunk::Marker(Marker::Error(message.clone())));
        *self.summary.lock().expect("stream summary mutex poisoned") = StreamRunSummary {
            success: false,
            tools_used: self.tools_used.clone(),
            final_content: String::new(),
            llm_calls: self.llm_calls,
            error_message: Some(message),
            history: Vec::new(),
        };
        self.finished = true;
        self.inner = None;
    }

    fn finish_with_answer(&mut self, content: String) {
        self.history.push(Message::assistant(content.clone()));
        *self.summary.lock().expect("stream summary mutex poisoned") = StreamRunSummary {
            success: true,
            tools_used: self.tools_used.clone(),
            final_content: content,
            llm_calls: self.llm_calls,
            error_message: None,
            history: self.history.clone(),
        };
        self.finished = true;
    }

    /// A round's stream ended with `tool_calls` (possibly empty). If tools
    /// are enabled and calls were requested, run them and loop; otherwise
    /// this is the terminal answer.
    async fn handle_round_end(&mut self, tool_calls: Vec<ToolCall>) {
        self.inner = None;

        if self.tools_enabled && !tool_calls.is_empty() {
            self.history.push(Message::assistant_with_tool_calls(self.accumulated_text.clone(), tool_calls.clone()));
            for call in &tool_calls {
                self.queue.push_back(crate::markers::StreamChunk::Marker(Marker::ToolStart(call.name.clone())));
            }

            let history_json = history_to_json(&self.history);
            let outcomes = self
                .orchestrator
                .execute_batch(&tool_calls, &self.ctx, &history_json, &self.allowlist, &self.call_counter, self.max_tool_calls, &self.cancellation)
                .await;

            match outcomes {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        self.queue.push_back(crate::markers::StreamChunk::Marker(Marker::ToolEnd(outcome.tool_name.clone())));
                        self.history.push(Message::tool(outcome.tool_call_id, outcome.content));
                        if outcome.invoked {
                            self.tools_used.push(outcome.tool_name);
                        }
                    }
                    if self.call_counter.load(Ordering::SeqCst) >= self.max_tool_calls {
                        self.tools_enabled = false;
                    }
                }
                Err(err) => self.finish_with_error(err.to_string()),
            }
            return;
        }

        if self.accumulated_text.is_empty() && tool_calls.is_empty() {
            self.finish_with_error("model returned empty content and no tool calls".to_string());
            return;
        }

        let content = std::mem::take(&mut self.accumulated_text);
        self.finish_with_answer(content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalStore;
    use crate::hooks::Hooks;
    use crate::observability::TracingMetrics;
    use crate::sanitize::ToolOutputSanitizer;
    use crate::tools::{ToolRegistry, tool};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine(registry: ToolRegistry) -> ReactEngine {
        let orchestrator = Arc::new(ToolCallOrchestrator::new(
            Arc::new(registry),
            Arc::new(Hooks::new()),
            Arc::new(ApprovalStore::new()),
            Arc::new(ToolOutputSanitizer::default()),
            Arc::new(TracingMetrics),
        ));
        ReactEngine::new(orchestrator)
    }

    fn ctx() -> HookContext {
        HookContext::new("run-1", None, "sys", "hi")
    }

    fn text_response(content: &str) -> ChatResponse {
        ChatResponse { content: content.to_string(), tool_calls: vec![], usage: None }
    }

    #[tokio::test]
    async fn test_simple_answer_terminates_in_one_round() {
        let engine = engine(ToolRegistry::new(vec![]));
        let call_llm: LlmCaller = Arc::new(|_history, _tools_enabled| Box::pin(async { Ok(text_response("hi")) }));

        let outcome = engine
            .run_batch(vec![Message::user("hello")], 10, &[], &ctx(), &CancellationToken::new(), &call_llm)
            .await
            .unwrap();

        assert_eq!(outcome.content, "hi");
        assert!(outcome.tools_used.is_empty());
        assert_eq!(outcome.llm_calls, 1);
    }

    #[tokio::test]
    async fn test_parallel_tool_calls_then_final_answer() {
        let weather = tool("weather", "weather").build(|_args| async { Ok(json!("sunny 25")) });
        let time = tool("time", "time").build(|_args| async { Ok(json!("15:00")) });
        let engine = engine(ToolRegistry::new(vec![weather, time]));

        let call_count = Arc::new(AtomicUsize::new(0));
        let count = call_count.clone();
        let call_llm: LlmCaller = Arc::new(move |_history, _tools_enabled| {
            let round = count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if round == 0 {
                    Ok(ChatResponse {
                        content: String::new(),
                        tool_calls: vec![ToolCall::new("c1", "weather", json!({"city": "Seoul"}).to_string()), ToolCall::new("c2", "time", json!({"zone": "KST"}).to_string())],
                        usage: None,
                    })
                } else {
                    Ok(text_response("Seoul is sunny 25 at 15:00"))
                }
            })
        });

        let outcome = engine
            .run_batch(vec![Message::user("weather and time?")], 10, &[], &ctx(), &CancellationToken::new(), &call_llm)
            .await
            .unwrap();

        assert_eq!(outcome.content, "Seoul is sunny 25 at 15:00");
        assert_eq!(outcome.llm_calls, 2);
        let mut used = outcome.tools_used.clone();
        used.sort();
        assert_eq!(used, vec!["time".to_string(), "weather".to_string()]);
    }

    #[tokio::test]
    async fn test_forced_final_round_when_max_tool_calls_reached() {
        // max_tool_calls=1: the model keeps requesting a tool, but after the
        // first one executes the next round must be forced tool-free.
        let echo = tool("echo", "echo").build(|args| async move { Ok(args) });
        let engine = engine(ToolRegistry::new(vec![echo]));

        let call_count = Arc::new(AtomicUsize::new(0));
        let count = call_count.clone();
        let call_llm: LlmCaller = Arc::new(move |_history, tools_enabled| {
            count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if tools_enabled {
                    Ok(ChatResponse { content: String::new(), tool_calls: vec![ToolCall::new("c1", "echo", "{}")], usage: None })
                } else {
                    Ok(text_response("done"))
                }
            })
        });

        let outcome = engine
            .run_batch(vec![Message::user("go")], 1, &[], &ctx(), &CancellationToken::new(), &call_llm)
            .await
            .unwrap();

        assert_eq!(outcome.content, "done");
        assert_eq!(outcome.llm_calls, 2);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bounded_loop_never_exceeds_max_plus_one() {
        let echo = tool("echo", "echo").build(|args| async move { Ok(args) });
        let engine = engine(ToolRegistry::new(vec![echo]));
        let max = 3u32;

        let call_llm: LlmCaller = Arc::new(move |_history, tools_enabled| {
            Box::pin(async move {
                if tools_enabled {
                    Ok(ChatResponse { content: String::new(), tool_calls: vec![ToolCall::new("c", "echo", "{}")], usage: None })
                } else {
                    Ok(text_response("final"))
                }
            })
        });

        let outcome = engine
            .run_batch(vec![Message::user("go")], max, &[], &ctx(), &CancellationToken::new(), &call_llm)
            .await
            .unwrap();

        assert!(outcome.llm_calls <= max + 1);
        assert_eq!(outcome.llm_calls, max + 1);
    }

    #[tokio::test]
    async fn test_empty_content_and_no_tool_calls_is_invalid_response() {
        let engine = engine(ToolRegistry::new(vec![]));
        let call_llm: LlmCaller = Arc::new(|_history, _tools_enabled| Box::pin(async { Ok(text_response("")) }));

        let result = engine.run_batch(vec![Message::user("go")], 10, &[], &ctx(), &CancellationToken::new(), &call_llm).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_call_llm_error_propagates() {
        let engine = engine(ToolRegistry::new(vec![]));
        let call_llm: LlmCaller = Arc::new(|_history, _tools_enabled| Box::pin(async { Err(Error::timeout()) }));

        let result = engine.run_batch(vec![Message::user("go")], 10, &[], &ctx(), &CancellationToken::new(), &call_llm).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    fn chat_stream_of(items: Vec<Result<ChatChunk>>) -> ChatStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn test_stream_forwards_text_and_tool_markers_then_final_result() {
        let weather = tool("weather", "weather").build(|_args| async { Ok(json!("sunny")) });
        let engine = engine(ToolRegistry::new(vec![weather]));

        let round = Arc::new(AtomicUsize::new(0));
        let round_clone = round.clone();
        let call_llm_stream: LlmStreamer = Arc::new(move |_history, _tools_enabled| {
            let n = round_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                chat_stream_of(vec![
                    Ok(ChatChunk::Content("Let me check ".to_string())),
                    Ok(ChatChunk::Finished { tool_calls: vec![ToolCall::new("c1", "weather", "{}")] }),
                ])
            } else {
                chat_stream_of(vec![Ok(ChatChunk::Content("Seoul is sunny.".to_string())), Ok(ChatChunk::Finished { tool_calls: vec![] })])
            }
        });

        let (stream, summary) = engine.run_stream(vec![Message::user("weather?")], 10, vec![], ctx(), CancellationToken::new(), call_llm_stream);
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(
            chunks,
            vec![
                crate::markers::StreamChunk::Text("Let me check ".to_string()),
                crate::markers::StreamChunk::Marker(Marker::ToolStart("weather".to_string())),
                crate::markers::StreamChunk::Marker(Marker::ToolEnd("weather".to_string())),
                crate::markers::StreamChunk::Text("Seoul is sunny.".to_string()),
            ]
        );

        let summary = summary.lock().unwrap();
        assert!(summary.success);
        assert_eq!(summary.final_content, "Seoul is sunny.");
        assert_eq!(summary.tools_used, vec!["weather".to_string()]);
        assert_eq!(summary.llm_calls, 2);
    }

    #[tokio::test]
    async fn test_stream_error_chunk_emits_error_marker_and_terminates() {
        let engine = engine(ToolRegistry::new(vec![]));
        let call_llm_stream: LlmStreamer = Arc::new(|_history, _tools_enabled| chat_stream_of(vec![Err(Error::api("boom".to_string()))]));

        let (stream, summary) = engine.run_stream(vec![Message::user("go")], 10, vec![], ctx(), CancellationToken::new(), call_llm_stream);
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], crate::markers::StreamChunk::Marker(Marker::Error(_))));
        assert!(!summary.lock().unwrap().success);
    }

    #[tokio::test]
    async fn test_stream_cancellation_terminates_with_error_marker() {
        let engine = engine(ToolRegistry::new(vec![]));
        let token = CancellationToken::new();
        token.cancel();
        let call_llm_stream: LlmStreamer =
            Arc::new(|_history, _tools_enabled| chat_stream_of(vec![Ok(ChatChunk::Content("hi".to_string()))]));

        let (stream, summary) = engine.run_stream(vec![Message::user("go")], 10, vec![], ctx(), token, call_llm_stream);
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], crate::markers::StreamChunk::Marker(Marker::Error(msg)) if msg == "Operation cancelled"));
        assert!(!summary.lock().unwrap().success);
    }

    #[tokio::test]
    async fn test_stream_forced_final_round_on_max_tool_calls() {
        let echo = tool("echo", "echo").build(|args| async move { Ok(args) });
        let engine = engine(ToolRegistry::new(vec![echo]));

        let call_llm_stream: LlmStreamer = Arc::new(move |_history, tools_enabled| {
            if tools_enabled {
                chat_stream_of(vec![Ok(ChatChunk::Finished { tool_calls: vec![ToolCall::new("c", "echo", "{}")] })])
            } else {
                chat_stream_of(vec![Ok(ChatChunk::Content("done".to_string())), Ok(ChatChunk::Finished { tool_calls: vec![] })])
            }
        });

        let (stream, summary) = engine.run_stream(vec![Message::user("go")], 1, vec![], ctx(), CancellationToken::new(), call_llm_stream);
        let _chunks: Vec<_> = stream.collect().await;

        let summary = summary.lock().unwrap();
        assert!(summary.success);
        assert_eq!(summary.final_content, "done");
        assert_eq!(summary.llm_calls, 2);
    }
}
