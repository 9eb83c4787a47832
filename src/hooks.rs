//! Hook executor.
//!
//! Four ordered hook families — `BeforeAgentStart`, `AfterAgentComplete`,
//! `BeforeToolCall`, `AfterToolCall` — each returning a tagged
//! [`HookOutcome`]. Each handler is fallible and carries an `order` (lower
//! runs first) plus a `fail_on_error` flag: a hook registered fail-open
//! (the default) that returns `Err` is logged and ignored, continuing to
//! the next hook as if it had returned `Continue`; one registered
//! fail-close aborts with `HookOutcome::Reject` (surfaced by callers as
//! `HOOK_REJECTED`) instead. `AfterAgentComplete`/`AfterToolCall` hooks fire
//! after the outcome they'd be reacting to is already fixed, so there is
//! nothing left to abort — their errors are always logged, at a higher
//! level when `fail_on_error` is set.

use crate::error::Result;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Explicit run context threaded through hook calls — the thread-local MDC
/// replacement. `metadata` uses a `Mutex` because tool-scope hooks may run
/// concurrently across a parallel tool batch and all write into the same
/// context (e.g. `hitlWaitMs_{tool}_{callIndex}`).
#[derive(Clone)]
pub struct HookContext {
    pub run_id: String,
    pub user_id: Option<String>,
    pub system_prompt: String,
    pub user_prompt: String,
    started_at: Instant,
    metadata: Arc<std::sync::Mutex<std::collections::HashMap<String, Value>>>,
}

impl HookContext {
    pub fn new(
        run_id: impl Into<String>,
        user_id: Option<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            user_id,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            started_at: Instant::now(),
            metadata: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.lock().expect("metadata mutex poisoned").insert(key.into(), value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.lock().expect("metadata mutex poisoned").get(key).cloned()
    }

    pub fn record_hitl_wait(&self, tool_name: &str, call_index: usize, wait_ms: u64) {
        self.set_metadata(format!("hitlWaitMs_{tool_name}_{call_index}"), Value::from(wait_ms));
    }
}

/// Event fired before a run begins processing the user's prompt.
#[derive(Debug, Clone)]
pub struct BeforeAgentStartEvent {
    pub prompt: String,
    pub history: Vec<Value>,
}

/// Event fired after a run has produced its final result, success or
/// failure. Always invoked.
#[derive(Debug, Clone)]
pub struct AfterAgentCompleteEvent {
    pub success: bool,
    pub content: Option<String>,
    pub history: Vec<Value>,
}

/// Event fired before a tool call executes.
#[derive(Debug, Clone)]
pub struct BeforeToolCallEvent {
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: String,
    pub history: Vec<Value>,
}

/// Event fired after a tool call completes, successfully or not.
#[derive(Debug, Clone)]
pub struct AfterToolCallEvent {
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: String,
    pub tool_result: Value,
    pub history: Vec<Value>,
}

/// Decision returned by a `BeforeAgentStart`/`BeforeToolCall` handler.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    Continue,
    Reject { reason: String },
    Modify { params: Value },
    PendingApproval { id: String, message: String },
}

impl HookOutcome {
    pub fn is_continue(&self) -> bool {
        matches!(self, HookOutcome::Continue)
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type BeforeAgentStartHandler =
    Arc<dyn Fn(BeforeAgentStartEvent, HookContext) -> BoxFuture<Result<HookOutcome>> + Send + Sync>;
pub type AfterAgentCompleteHandler =
    Arc<dyn Fn(AfterAgentCompleteEvent, HookContext) -> BoxFuture<Result<()>> + Send + Sync>;
pub type BeforeToolCallHandler =
    Arc<dyn Fn(BeforeToolCallEvent, HookContext) -> BoxFuture<Result<HookOutcome>> + Send + Sync>;
pub type AfterToolCallHandler =
    Arc<dyn Fn(AfterToolCallEvent, HookContext) -> BoxFuture<Result<()>> + Send + Sync>;

struct Registered<H> {
    order: i32,
    fail_on_error: bool,
    handler: H,
}

/// Container and executor for all four hook families.
#[derive(Default)]
pub struct Hooks {
    before_agent_start: Vec<Registered<BeforeAgentStartHandler>>,
    after_agent_complete: Vec<Registered<AfterAgentCompleteHandler>>,
    before_tool_call: Vec<Registered<BeforeToolCallHandler>>,
    after_tool_call: Vec<Registered<AfterToolCallHandler>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before_agent_start<F, Fut>(mut self, order: i32, fail_on_error: bool, handler: F) -> Self
    where
        F: Fn(BeforeAgentStartEvent, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
    {
        self.before_agent_start.push(Registered { order, fail_on_error, handler: Arc::new(move |e, ctx| Box::pin(handler(e, ctx))) });
        self.before_agent_start.sort_by_key(|r| r.order);
        self
    }

    pub fn add_after_agent_complete<F, Fut>(mut self, order: i32, fail_on_error: bool, handler: F) -> Self
    where
        F: Fn(AfterAgentCompleteEvent, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_agent_complete.push(Registered { order, fail_on_error, handler: Arc::new(move |e, ctx| Box::pin(handler(e, ctx))) });
        self.after_agent_complete.sort_by_key(|r| r.order);
        self
    }

    pub fn add_before_tool_call<F, Fut>(mut self, order: i32, fail_on_error: bool, handler: F) -> Self
    where
        F: Fn(BeforeToolCallEvent, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
    {
        self.before_tool_call.push(Registered { order, fail_on_error, handler: Arc::new(move |e, ctx| Box::pin(handler(e, ctx))) });
        self.before_tool_call.sort_by_key(|r| r.order);
        self
    }

    pub fn add_after_tool_call<F, Fut>(mut self, order: i32, fail_on_error: bool, handler: F) -> Self
    where
        F: Fn(AfterToolCallEvent, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_tool_call.push(Registered { order, fail_on_error, handler: Arc::new(move |e, ctx| Box::pin(handler(e, ctx))) });
        self.after_tool_call.sort_by_key(|r| r.order);
        self
    }

    /// Run `BeforeAgentStart` hooks in order. The first non-`Continue`
    /// outcome short-circuits and is returned. A fail-open handler's error
    /// is logged and treated as `Continue`; a fail-close handler's error
    /// aborts with `HookOutcome::Reject`.
    pub async fn execute_before_agent_start(&self, event: BeforeAgentStartEvent, ctx: &HookContext) -> HookOutcome {
        for reg in &self.before_agent_start {
            match (reg.handler)(event.clone(), ctx.clone()).await {
                Ok(outcome) if !outcome.is_continue() => return outcome,
                Ok(_) => {}
                Err(err) => {
                    if reg.fail_on_error {
                        return HookOutcome::Reject { reason: format!("before_agent_start hook failed: {err}") };
                    }
                    tracing::warn!(error = %err, run_id = %ctx.run_id, "before_agent_start hook failed, continuing (fail-open)");
                }
            }
        }
        HookOutcome::Continue
    }

    /// Run `AfterAgentComplete` hooks. Always runs every hook regardless of
    /// the run's outcome; there is no run left to abort, so every error is
    /// logged rather than rejected.
    pub async fn execute_after_agent_complete(&self, event: AfterAgentCompleteEvent, ctx: &HookContext) {
        for reg in &self.after_agent_complete {
            if let Err(err) = (reg.handler)(event.clone(), ctx.clone()).await {
                if reg.fail_on_error {
                    tracing::error!(error = %err, run_id = %ctx.run_id, "after_agent_complete hook failed (fail-close)");
                } else {
                    tracing::warn!(error = %err, run_id = %ctx.run_id, "after_agent_complete hook failed, ignoring (fail-open)");
                }
            }
        }
    }

    /// Run `BeforeToolCall` hooks in order, short-circuiting on the first
    /// non-`Continue` outcome. A fail-open handler's error is logged and
    /// treated as `Continue`; a fail-close handler's error aborts the call
    /// with `HookOutcome::Reject` (surfaced as `HOOK_REJECTED`).
    pub async fn execute_before_tool_call(&self, event: BeforeToolCallEvent, ctx: &HookContext) -> HookOutcome {
        for reg in &self.before_tool_call {
            match (reg.handler)(event.clone(), ctx.clone()).await {
                Ok(outcome) if !outcome.is_continue() => return outcome,
                Ok(_) => {}
                Err(err) => {
                    if reg.fail_on_error {
                        return HookOutcome::Reject { reason: format!("before_tool_call hook failed: {err}") };
                    }
                    tracing::warn!(error = %err, run_id = %ctx.run_id, tool = %event.tool_name, "before_tool_call hook failed, continuing (fail-open)");
                }
            }
        }
        HookOutcome::Continue
    }

    /// Run `AfterToolCall` hooks. Always invoked regardless of the call's
    /// success; errors are logged, never rejected, since the tool call has
    /// already completed.
    pub async fn execute_after_tool_call(&self, event: AfterToolCallEvent, ctx: &HookContext) {
        for reg in &self.after_tool_call {
            if let Err(err) = (reg.handler)(event.clone(), ctx.clone()).await {
                if reg.fail_on_error {
                    tracing::error!(error = %err, run_id = %ctx.run_id, tool = %event.tool_name, "after_tool_call hook failed (fail-close)");
                } else {
                    tracing::warn!(error = %err, run_id = %ctx.run_id, tool = %event.tool_name, "after_tool_call hook failed, ignoring (fail-open)");
                }
            }
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_agent_start", &self.before_agent_start.len())
            .field("after_agent_complete", &self.after_agent_complete.len())
            .field("before_tool_call", &self.before_tool_call.len())
            .field("after_tool_call", &self.after_tool_call.len())
            .finish()
    }
}

/// Synthesize the tool-message content fed back to the model when a
/// `BeforeToolCall` hook rejects a call.
pub fn tool_rejection_message(reason: &str) -> String {
    format!("Tool call rejected: {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HookContext {
        HookContext::new("run-1", None, "sys", "hi")
    }

    #[tokio::test]
    async fn test_before_tool_call_reject_short_circuits() {
        let reached = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reached2 = reached.clone();
        let hooks = Hooks::new()
            .add_before_tool_call(0, false, |event, _ctx| async move {
                if event.tool_name == "dangerous" {
                    Ok(HookOutcome::Reject { reason: "blocked".into() })
                } else {
                    Ok(HookOutcome::Continue)
                }
            })
            .add_before_tool_call(10, false, move |_event, _ctx| {
                let reached2 = reached2.clone();
                async move {
                    reached2.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(HookOutcome::Continue)
                }
            });

        let event = BeforeToolCallEvent {
            tool_name: "dangerous".into(),
            tool_input: serde_json::json!({}),
            tool_use_id: "id1".into(),
            history: vec![],
        };
        let outcome = hooks.execute_before_tool_call(event, &ctx()).await;
        assert!(matches!(outcome, HookOutcome::Reject { .. }));
        assert!(!reached.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ordering_runs_lower_order_first() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_a = seen.clone();
        let seen_b = seen.clone();
        let hooks = Hooks::new()
            .add_before_agent_start(10, false, move |_e, _c| {
                let seen_a = seen_a.clone();
                async move {
                    seen_a.lock().unwrap().push("second");
                    Ok(HookOutcome::Continue)
                }
            })
            .add_before_agent_start(0, false, move |_e, _c| {
                let seen_b = seen_b.clone();
                async move {
                    seen_b.lock().unwrap().push("first");
                    Ok(HookOutcome::Continue)
                }
            });

        let event = BeforeAgentStartEvent { prompt: "hi".into(), history: vec![] };
        hooks.execute_before_agent_start(event, &ctx()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_after_agent_complete_always_runs() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let hooks = Hooks::new().add_after_agent_complete(0, false, move |_e, _c| {
            let ran2 = ran2.clone();
            async move {
                ran2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });
        let event = AfterAgentCompleteEvent { success: false, content: None, history: vec![] };
        hooks.execute_after_agent_complete(event, &ctx()).await;
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fail_open_handler_error_is_ignored() {
        let hooks = Hooks::new()
            .add_before_agent_start(0, false, |_e, _c| async move { Err(crate::error::Error::other("boom")) })
            .add_before_agent_start(10, false, |_e, _c| async move { Ok(HookOutcome::Continue) });

        let event = BeforeAgentStartEvent { prompt: "hi".into(), history: vec![] };
        let outcome = hooks.execute_before_agent_start(event, &ctx()).await;
        assert!(outcome.is_continue());
    }

    #[tokio::test]
    async fn test_fail_close_handler_error_rejects() {
        let hooks = Hooks::new()
            .add_before_tool_call(0, true, |_e, _c| async move { Err(crate::error::Error::other("boom")) });

        let event = BeforeToolCallEvent {
            tool_name: "dangerous".into(),
            tool_input: serde_json::json!({}),
            tool_use_id: "id1".into(),
            history: vec![],
        };
        let outcome = hooks.execute_before_tool_call(event, &ctx()).await;
        assert!(matches!(outcome, HookOutcome::Reject { .. }));
    }

    #[test]
    fn test_tool_rejection_message_format() {
        assert_eq!(tool_rejection_message("blocked"), "Tool call rejected: blocked");
    }

    #[test]
    fn test_hitl_wait_recording() {
        let context = ctx();
        context.record_hitl_wait("weather", 0, 1500);
        let value = context.get_metadata("hitlWaitMs_weather_0");
        assert_eq!(value, Some(serde_json::Value::from(1500)));
    }
}
