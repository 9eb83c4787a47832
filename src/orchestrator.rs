//! Tool call orchestrator.
//!
//! Executes a batch of [`ToolCall`]s requested in a single LLM step: one
//! `tokio::spawn`ed task per call, joined back into positional order. A
//! call short-circuits (without ever invoking the adapter) on the total
//! call counter, the allowlist, a `BeforeToolCall` rejection, or a denied
//! approval; otherwise it runs under a per-tool timeout, its success output
//! is sanitized through [`ToolOutputSanitizer`], and the `AfterToolCall`
//! hook always fires. One call failing never cancels its siblings — the
//! only thing that aborts the whole batch is the run's own cancellation
//! token.

use crate::approval::{ApprovalDecision, ApprovalStore};
use crate::capabilities::AgentMetrics;
use crate::codec::parse_tool_arguments;
use crate::concurrency::{CancellationToken, wait_for_cancellation, with_deadline};
use crate::error::{Error, Result};
use crate::hooks::{AfterToolCallEvent, BeforeToolCallEvent, HookContext, HookOutcome, Hooks, tool_rejection_message};
use crate::sanitize::ToolOutputSanitizer;
use crate::tools::ToolRegistry;
use crate::types::ToolCall;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Default per-tool invocation timeout when a [`crate::tools::Tool`] doesn't
/// override it.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// A policy deciding whether a tool call needs human approval before it
/// runs, independent of any `BeforeToolCall` hook. Checked after the hook
/// passes; either mechanism can trigger the approval gate.
pub type ApprovalPolicy = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Outcome of one tool call, ready to become a `ToolMessage`.
#[derive(Debug, Clone)]
pub struct ToolExecutionOutcome {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    /// Whether the adapter was actually invoked (vs. short-circuited by the
    /// counter, allowlist, a hook, or an approval denial). Only `invoked`
    /// calls should count toward a run's `toolsUsed` list.
    pub invoked: bool,
    pub succeeded: bool,
}

pub struct ToolCallOrchestrator {
    registry: Arc<ToolRegistry>,
    hooks: Arc<Hooks>,
    approvals: Arc<ApprovalStore>,
    sanitizer: Arc<ToolOutputSanitizer>,
    metrics: Arc<dyn AgentMetrics>,
    default_timeout: Duration,
    approval_timeout: Duration,
    approval_policy: Option<ApprovalPolicy>,
}

impl ToolCallOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        hooks: Arc<Hooks>,
        approvals: Arc<ApprovalStore>,
        sanitizer: Arc<ToolOutputSanitizer>,
        metrics: Arc<dyn AgentMetrics>,
    ) -> Self {
        Self {
            registry,
            hooks,
            approvals,
            sanitizer,
            metrics,
            default_timeout: Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS),
            approval_timeout: Duration::from_secs(300),
            approval_policy: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval_policy = Some(policy);
        self
    }

    /// Execute a batch of calls concurrently, returning outcomes in the same
    /// order as `calls`. Requires an `Arc<Self>` receiver so each spawned
    /// task can hold its own clone of the orchestrator's collaborators.
    pub async fn execute_batch(
        self: &Arc<Self>,
        calls: &[ToolCall],
        ctx: &HookContext,
        history: &[Value],
        allowlist: &[String],
        call_counter: &Arc<AtomicU32>,
        max_tool_calls: u32,
        cancellation: &CancellationToken,
    ) -> Result<Vec<ToolExecutionOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let mut handles = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().cloned().enumerate() {
            let orchestrator = self.clone();
            let ctx = ctx.clone();
            let history = history.to_vec();
            let allowlist = allowlist.to_vec();
            let counter = call_counter.clone();
            let cancellation = cancellation.clone();
            handles.push(tokio::spawn(async move {
                let outcome = orchestrator
                    .execute_one(call, &ctx, &history, &allowlist, &counter, max_tool_calls, &cancellation)
                    .await;
                (index, outcome)
            }));
        }

        tokio::select! {
            biased;
            results = futures::future::join_all(handles.iter_mut()) => {
                let mut outcomes: Vec<Option<ToolExecutionOutcome>> = vec![None; calls.len()];
                for joined in results {
                    let (index, outcome) = joined.map_err(|e| Error::other(format!("tool task panicked: {e}")))?;
                    outcomes[index] = Some(outcome);
                }
                Ok(outcomes.into_iter().map(|o| o.expect("every index filled by its own task")).collect())
            }
            _ = wait_for_cancellation(cancellation) => {
                for handle in &handles {
                    handle.abort();
                }
                Err(Error::Cancelled)
            }
        }
    }

    async fn execute_one(
        &self,
        call: ToolCall,
        ctx: &HookContext,
        history: &[Value],
        allowlist: &[String],
        call_counter: &AtomicU32,
        max_tool_calls: u32,
        cancellation: &CancellationToken,
    ) -> ToolExecutionOutcome {
        let mut arguments = Value::Object(parse_tool_arguments(&call.arguments));

        if cancellation.is_cancelled() {
            return self.finish(call, ctx, history, arguments, "Operation cancelled".to_string(), false, false).await;
        }

        let prior_count = call_counter.fetch_add(1, Ordering::SeqCst);
        if prior_count >= max_tool_calls {
            let message = format!("Maximum tool call limit ({max_tool_calls}) reached");
            self.metrics.record_tool_call(&call.name, false, 0);
            return self.finish(call, ctx, history, arguments, message, false, false).await;
        }

        if !self.registry.is_allowed(&call.name, allowlist) {
            let message = format!("Tool '{}' is not allowed for this request", call.name);
            self.metrics.record_tool_call(&call.name, false, 0);
            return self.finish(call, ctx, history, arguments, message, false, false).await;
        }

        let Some(tool) = self.registry.get(&call.name).cloned() else {
            let message = format!("Tool '{}' is not registered", call.name);
            self.metrics.record_tool_call(&call.name, false, 0);
            return self.finish(call, ctx, history, arguments, message, false, false).await;
        };

        let before_event = BeforeToolCallEvent {
            tool_name: call.name.clone(),
            tool_input: arguments.clone(),
            tool_use_id: call.id.clone(),
            history: history.to_vec(),
        };
        match self.hooks.execute_before_tool_call(before_event, ctx).await {
            HookOutcome::Continue => {}
            HookOutcome::Modify { params } => arguments = params,
            HookOutcome::Reject { reason } => {
                let message = tool_rejection_message(&reason);
                self.metrics.record_tool_call(&call.name, false, 0);
                return self.finish(call, ctx, history, arguments, message, false, false).await;
            }
            HookOutcome::PendingApproval { id, .. } => {
                if let Some(message) = self.await_approval(&id, &call, ctx, &arguments).await {
                    self.metrics.record_tool_call(&call.name, false, 0);
                    return self.finish(call, ctx, history, arguments, message, false, false).await;
                }
            }
        }

        if let Some(policy) = &self.approval_policy {
            if policy(&call.name, &arguments) {
                let approval_id = format!("{}-{}", ctx.run_id, call.id);
                if let Some(message) = self.await_approval(&approval_id, &call, ctx, &arguments).await {
                    self.metrics.record_tool_call(&call.name, false, 0);
                    return self.finish(call, ctx, history, arguments, message, false, false).await;
                }
            }
        }

        let timeout_ms = tool.timeout_ms().unwrap_or(self.default_timeout.as_millis() as u64);
        let started = Instant::now();
        let invocation = with_deadline(tool.execute(arguments.clone()), Duration::from_millis(timeout_ms), cancellation).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match invocation {
            Ok(value) => {
                self.metrics.record_tool_call(&call.name, true, duration_ms);
                let raw = serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
                let sanitized = self.sanitizer.sanitize(&raw);
                self.finish(call, ctx, history, arguments, sanitized, true, true).await
            }
            Err(Error::Timeout) => {
                self.metrics.record_tool_call(&call.name, false, duration_ms);
                let message = format!("Tool '{}' timed out after {timeout_ms}ms", call.name);
                self.finish(call, ctx, history, arguments, message, true, false).await
            }
            Err(Error::Cancelled) => {
                self.metrics.record_tool_call(&call.name, false, duration_ms);
                self.finish(call, ctx, history, arguments, "Operation cancelled".to_string(), true, false).await
            }
            Err(err) => {
                self.metrics.record_tool_call(&call.name, false, duration_ms);
                let message = format!("Error: {err}");
                self.finish(call, ctx, history, arguments, message, true, false).await
            }
        }
    }

    /// Blocks on the approval store. Returns `None` when approved (caller
    /// proceeds), `Some(rejection message)` otherwise.
    async fn await_approval(&self, approval_id: &str, call: &ToolCall, ctx: &HookContext, arguments: &Value) -> Option<String> {
        let started = Instant::now();
        let decision = self
            .approvals
            .request_approval(approval_id.to_string(), &ctx.run_id, ctx.user_id.as_deref(), &call.name, arguments, self.approval_timeout)
            .await
            .unwrap_or_else(|_| ApprovalDecision::rejected("approval store error"));
        ctx.record_hitl_wait(&call.name, 0, started.elapsed().as_millis() as u64);

        if decision.approved {
            None
        } else {
            let reason = decision.reason.unwrap_or_else(|| "approval rejected".to_string());
            Some(tool_rejection_message(&reason))
        }
    }

    async fn finish(
        &self,
        call: ToolCall,
        ctx: &HookContext,
        history: &[Value],
        arguments: Value,
        content: String,
        invoked: bool,
        succeeded: bool,
    ) -> ToolExecutionOutcome {
        let after_event = AfterToolCallEvent {
            tool_name: call.name.clone(),
            tool_input: arguments,
            tool_use_id: call.id.clone(),
            tool_result: Value::String(content.clone()),
            history: history.to_vec(),
        };
        self.hooks.execute_after_tool_call(after_event, ctx).await;
        ToolExecutionOutcome { tool_call_id: call.id, tool_name: call.name, content, invoked, succeeded }
    }
}
