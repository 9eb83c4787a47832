//! Capability interfaces the engine consumes from collaborators.
//!
//! Only the capabilities with more than one plausible implementation get a
//! trait boundary here: `ChatModel` (mock vs. bundled HTTP impl in tests),
//! `MemoryStore` (callers bring their own persistence), `FallbackStrategy`,
//! `GuardAuditPublisher`, and `AgentMetrics`. `ApprovalStore`, `ResponseCache`
//! and `CircuitBreaker` are process-wide singletons per spec.md §5 with a
//! single concrete implementation each (`approval.rs`, `cache.rs`,
//! `breaker.rs`) — trait-ifying them would add indirection with no second
//! implementation, so they're consumed directly. `ErrorMessageResolver`
//! lives in `error.rs`, next to the `AgentErrorKind` it's keyed by.
//! `ToolCallback` is embodied by `tools::Tool` rather than a separate trait,
//! since a tool already bundles invoke/name/description/schema.

use crate::error::Result;
use crate::types::{Message, ToolCall};
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// Per-call tuning passed to a [`ChatModel`]. Distinct from [`crate::types::AgentCommand`]
/// so the chat model boundary doesn't leak engine-level concerns (guards, hooks, caching).
#[derive(Debug, Clone)]
pub struct ChatCallOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub tools: Vec<serde_json::Value>,
}

/// A completed, non-streaming model turn.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<crate::types::TokenUsage>,
}

/// One increment of a streaming model turn. Text deltas are forwarded
/// downstream immediately; tool calls are only known complete at `Finished`.
#[derive(Debug, Clone)]
pub enum ChatChunk {
    Content(String),
    Finished { tool_calls: Vec<ToolCall> },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// The single collaborator the ReAct loop calls out to for model turns.
/// The bundled implementation (`crate::chat_model::OpenAiChatModel`) talks to
/// any OpenAI-compatible local server; tests swap in a scripted mock.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn call(&self, system: &str, messages: &[Message], options: &ChatCallOptions) -> Result<ChatResponse>;

    fn stream(&self, system: &str, messages: &[Message], options: &ChatCallOptions) -> ChatStream;
}

/// Conversation persistence, keyed by session. Implementations own their own
/// per-session serialization (spec.md §5: "MemoryStore implementations are
/// responsible for per-session serialization when required").
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn save(&self, user_id: Option<&str>, session_id: &str, messages: &[Message]) -> Result<()>;
    async fn remove(&self, session_id: &str) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<String>>;
}

/// Strategy for trying alternate models after retries + breaker are
/// exhausted. `call` performs one tool-free single-shot completion against
/// the named model.
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    async fn run(
        &self,
        original_error: crate::error::Error,
        models: &[String],
        call: &(dyn Fn(&str) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send>> + Send + Sync),
    ) -> Result<String>;
}

/// The bundled `FallbackStrategy`, delegating to [`crate::fallback::run_fallback`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialFallback;

#[async_trait]
impl FallbackStrategy for SequentialFallback {
    async fn run(
        &self,
        original_error: crate::error::Error,
        models: &[String],
        call: &(dyn Fn(&str) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send>> + Send + Sync),
    ) -> Result<String> {
        crate::fallback::run_fallback(original_error, models, |model| call(model)).await
    }
}

/// Audit sink for guard decisions (input and output). A no-op default is
/// provided in `observability.rs`; real deployments publish to a SIEM/queue.
pub trait GuardAuditPublisher: Send + Sync {
    fn publish(&self, event: GuardAuditEvent);
}

/// One guard decision worth auditing.
#[derive(Debug, Clone)]
pub struct GuardAuditEvent {
    pub run_id: String,
    pub stage: String,
    pub outcome: String,
    pub reason: Option<String>,
}

/// Metrics sink for terminal outcomes, tool-call counts, guard rejections,
/// breaker transitions, fallback attempts, and cache hits (spec.md §7
/// Observability). The default implementation in `observability.rs` emits
/// `tracing` events; a real deployment wires this to Prometheus/OTel.
pub trait AgentMetrics: Send + Sync {
    fn record_run(&self, success: bool, duration_ms: u64, error_kind: Option<crate::error::AgentErrorKind>);
    fn record_tool_call(&self, tool_name: &str, success: bool, duration_ms: u64);
    fn record_guard_rejection(&self, stage: &str);
    fn record_breaker_transition(&self, from: &str, to: &str);
    fn record_fallback_attempt(&self, model: &str, success: bool);
    fn record_cache_hit(&self, hit: bool);
}
