//! # agent-core
//!
//! A ReAct-style execution engine for LLM-backed conversational agents
//! talking to local, OpenAI-compatible servers (LM Studio, Ollama,
//! llama.cpp, vLLM — see [`config::Provider`]).
//!
//! ## Key features
//!
//! - **Guarded**: ordered input/output guard pipelines with pluggable stages
//! - **Hook-able**: four hook families (before/after agent, before/after tool)
//! - **Human-in-the-loop**: an approval store suspends tool calls pending
//!   an external decision
//! - **Resilient**: retry with backoff, a circuit breaker, and sequential
//!   model fallback
//! - **Cached**: response caching keyed on a SHA-256 fingerprint of the
//!   turn's inputs
//! - **Batch and streaming**: the same ReAct loop drives both an
//!   all-at-once `execute()` and a chunk-by-chunk `execute_stream()`
//!
//! ## Architecture
//!
//! - **capabilities**: trait boundaries for pluggable collaborators
//!   (`ChatModel`, `MemoryStore`, `FallbackStrategy`,
//!   `GuardAuditPublisher`, `AgentMetrics`)
//! - **chat_model**: the bundled OpenAI-compatible `ChatModel`
//! - **types**: message, command, and result data structures
//! - **tools**: tool definition and registry
//! - **guards** / **output_guards**: input/output policy pipelines
//! - **hooks**: lifecycle hook executor
//! - **approval**: human-in-the-loop approval store
//! - **orchestrator**: parallel tool call execution
//! - **react**: the ReAct batch/streaming state machine
//! - **lifecycle**: the top-level agent run assembly
//! - **trimmer**: conversation history trimming
//! - **retry** / **breaker** / **fallback**: resilience primitives
//! - **cache**: response cache
//! - **sanitize**: tool output sanitization
//! - **observability**: default `tracing`-backed metrics/audit sinks
//! - **config**: provider configuration helpers
//! - **error**: the crate's `Error`/`Result` types

mod approval;
mod breaker;
mod cache;
mod capabilities;
mod chat_model;
mod codec;
mod concurrency;
mod config;
mod error;
mod fallback;
mod guards;
mod hooks;
mod lifecycle;
mod markers;
mod observability;
mod orchestrator;
mod output_guards;
mod react;
mod sanitize;
mod tools;
mod trimmer;
mod types;
mod utils;

pub mod retry;

// --- Capability traits ---

pub use capabilities::{
    AgentMetrics, ChatCallOptions, ChatChunk, ChatModel, ChatResponse, ChatStream,
    FallbackStrategy, GuardAuditEvent, GuardAuditPublisher, MemoryStore, SequentialFallback,
};

// --- Bundled chat model ---

pub use chat_model::OpenAiChatModel;

// --- Provider configuration ---

pub use config::{Provider, get_base_url, get_model};

// --- Error handling ---

pub use error::{AgentErrorKind, DefaultErrorMessageResolver, Error, ErrorMessageResolver, Result, classify_error};

// --- Hooks ---

pub use hooks::{
    AfterAgentCompleteEvent, AfterToolCallEvent, BeforeAgentStartEvent, BeforeToolCallEvent,
    HookContext, HookOutcome, Hooks,
};

// --- Approval store (human-in-the-loop) ---

pub use approval::{ApprovalDecision, ApprovalStore};

// --- Tool system ---

pub use tools::{Tool, ToolBuilder, ToolRegistry, tool};

// --- Guard pipelines ---

pub use guards::{GuardDecision, GuardStage, InputGuardPipeline, PromptInjectionStage, RejectionCategory};
pub use output_guards::{
    CanaryTokenStage, MinLengthStage, OutputDecision, OutputGuardPipeline, OutputGuardStage,
    OutputRejectionCategory, PiiMaskingStage, PolicyViolationStage,
};

// --- Resilience primitives ---

pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::{CachedResponse, ResponseCache, cache_key};
pub use retry::RetryConfig;

// --- Conversation trimming ---

pub use trimmer::{estimate_tokens, trim_history};

// --- Core types ---

pub use types::{
    AgentCommand, AgentCommandBuilder, AgentMode, AgentResult, BaseUrl, GuardCommand, MediaAttachment,
    MediaSource, Message, MessageRole, ModelName, OutputGuardContext, ResponseFormat, Temperature,
    TokenUsage, ToolCall, metadata_keys,
};

// --- Stream markers ---

pub use markers::{Marker, StreamChunk};

// --- Observability defaults ---

pub use observability::{NoopAuditPublisher, TracingMetrics};

// --- Tool output sanitization ---

pub use sanitize::{SanitizeStage, ToolOutputSanitizer};

// --- Tool call orchestration ---

pub use orchestrator::{ApprovalPolicy, ToolCallOrchestrator, ToolExecutionOutcome, DEFAULT_TOOL_TIMEOUT_MS};

// --- ReAct engine ---

pub use react::{LlmCaller, LlmStreamer, ReactEngine, ReactOutcome, StreamRunSummary};

// --- Agent run lifecycle ---

pub use lifecycle::{AgentEngine, StreamFinalizer};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The most commonly used types and functions. `use agent_core::prelude::*;`
/// covers typical usage: building a command, defining tools, and reading
/// results back.
pub mod prelude {
    pub use crate::{
        AgentCommand, AgentCommandBuilder, AgentEngine, AgentErrorKind, AgentMetrics, AgentResult,
        ChatCallOptions, ChatModel, Error, GuardAuditPublisher, Hooks, Message, MessageRole,
        OpenAiChatModel, Result, Tool, ToolBuilder, ToolRegistry, tool,
    };
}
