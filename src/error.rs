//! Error types for the agent execution engine.
//!
//! Two layers, deliberately kept separate:
//!
//! - [`Error`]: low-level transport/infrastructure failures (HTTP, JSON,
//!   configuration, tool execution), used by the bundled
//!   [`crate::chat_model`] and [`crate::tools`] implementations.
//! - [`AgentErrorKind`]: the run-level outcome classification that
//!   [`crate::lifecycle`] reports on `AgentResult`. `classify_error` maps
//!   the former onto the latter at the lifecycle boundary.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Low-level transport/infrastructure error type.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// API error from the model server
    #[error("API error: {0}")]
    Api(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// A cancellation token fired. Must never be reported as a tool or run
    /// failure: every catch-all in the engine re-checks and re-raises this
    /// variant before treating anything else as an error.
    #[error("Operation cancelled")]
    Cancelled,

    /// The circuit breaker is OPEN and rejected the call without attempting it.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// True for transient errors worth retrying (network issues, timeouts,
    /// 5xx server errors). False for client errors and cancellation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Timeout => true,
            Error::Stream(_) => true,
            Error::Api(msg) => {
                msg.contains("500") || msg.contains("502") || msg.contains("503") || msg.contains("504")
            }
            Error::Cancelled => false,
            _ => false,
        }
    }

    /// True if this error represents cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Run-level outcome classification surfaced on `AgentResult::error_code`.
///
/// Deterministic policy outcomes (`RATE_LIMITED`, `GUARD_REJECTED`,
/// `OUTPUT_GUARD_REJECTED`, `OUTPUT_TOO_SHORT`, `HOOK_REJECTED`,
/// `CIRCUIT_BREAKER_OPEN`) are produced directly by the stage that decided
/// them; everything else passes through `classify_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentErrorKind {
    RateLimited,
    Timeout,
    ContextTooLong,
    ToolError,
    GuardRejected,
    HookRejected,
    InvalidResponse,
    OutputGuardRejected,
    OutputTooShort,
    CircuitBreakerOpen,
    Unknown,
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentErrorKind::RateLimited => "RATE_LIMITED",
            AgentErrorKind::Timeout => "TIMEOUT",
            AgentErrorKind::ContextTooLong => "CONTEXT_TOO_LONG",
            AgentErrorKind::ToolError => "TOOL_ERROR",
            AgentErrorKind::GuardRejected => "GUARD_REJECTED",
            AgentErrorKind::HookRejected => "HOOK_REJECTED",
            AgentErrorKind::InvalidResponse => "INVALID_RESPONSE",
            AgentErrorKind::OutputGuardRejected => "OUTPUT_GUARD_REJECTED",
            AgentErrorKind::OutputTooShort => "OUTPUT_TOO_SHORT",
            AgentErrorKind::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            AgentErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Map a transport-level `Error` onto its `AgentErrorKind`. Tool failures
/// that surface here (rather than as a ToolMessage fed back to the model)
/// are by definition unrecoverable within the run.
pub fn classify_error(err: &Error) -> AgentErrorKind {
    match err {
        Error::Timeout => AgentErrorKind::Timeout,
        Error::CircuitOpen => AgentErrorKind::CircuitBreakerOpen,
        Error::Tool(_) => AgentErrorKind::ToolError,
        Error::Api(msg) if is_context_length_error(msg) => AgentErrorKind::ContextTooLong,
        Error::Api(msg) if msg.contains("429") => AgentErrorKind::RateLimited,
        Error::InvalidInput(_) => AgentErrorKind::InvalidResponse,
        _ => AgentErrorKind::Unknown,
    }
}

/// Recognizes the context-length-exceeded family of API error bodies
/// emitted by OpenAI-compatible servers (`context_length_exceeded`,
/// `"maximum context length"`, etc).
pub fn is_context_length_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context_length_exceeded")
        || lower.contains("context length")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
}

/// Produces the textual error surface shown to callers for a given
/// `AgentErrorKind`, optionally appending the original underlying message.
/// Defaults are English; a locale-aware resolver can be swapped in behind
/// the same trait.
pub trait ErrorMessageResolver: Send + Sync {
    fn resolve(&self, kind: AgentErrorKind, original: Option<&str>) -> String;
}

/// Default English resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorMessageResolver;

impl ErrorMessageResolver for DefaultErrorMessageResolver {
    fn resolve(&self, kind: AgentErrorKind, original: Option<&str>) -> String {
        let base = match kind {
            AgentErrorKind::RateLimited => "Rate limit exceeded, please try again later",
            AgentErrorKind::Timeout => "The request timed out",
            AgentErrorKind::ContextTooLong => "Conversation is too long to process even after trimming",
            AgentErrorKind::ToolError => "A tool call failed and could not be recovered",
            AgentErrorKind::GuardRejected => "Input was rejected by policy",
            AgentErrorKind::HookRejected => "Run was rejected by a hook",
            AgentErrorKind::InvalidResponse => "Model produced an unusable response",
            AgentErrorKind::OutputGuardRejected => "Output was rejected by policy",
            AgentErrorKind::OutputTooShort => "Model response was shorter than the allowed minimum",
            AgentErrorKind::CircuitBreakerOpen => "Upstream model is temporarily unavailable",
            AgentErrorKind::Unknown => "An unexpected error occurred",
        };
        match original {
            Some(orig) if !orig.is_empty() => format!("{base}: {orig}"),
            _ => base.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("Invalid model");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: Invalid model");
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::timeout().is_retryable());
        assert!(Error::api("500 Internal Server Error".into()).is_retryable());
        assert!(!Error::config("bad".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_is_cancellation() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::timeout().is_cancellation());
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error(&Error::timeout()), AgentErrorKind::Timeout);
        assert_eq!(classify_error(&Error::CircuitOpen), AgentErrorKind::CircuitBreakerOpen);
        assert_eq!(classify_error(&Error::tool("x".into())), AgentErrorKind::ToolError);
        assert_eq!(classify_error(&Error::api("429 too many".into())), AgentErrorKind::RateLimited);
        assert_eq!(classify_error(&Error::other("?".into())), AgentErrorKind::Unknown);
    }

    #[test]
    fn test_classify_error_context_too_long() {
        let err = Error::api("API error 400: {\"error\":{\"code\":\"context_length_exceeded\",\"message\":\"This model's maximum context length is 8192 tokens\"}}".into());
        assert_eq!(classify_error(&err), AgentErrorKind::ContextTooLong);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(AgentErrorKind::CircuitBreakerOpen.to_string(), "CIRCUIT_BREAKER_OPEN");
        assert_eq!(AgentErrorKind::Unknown.to_string(), "UNKNOWN");
    }

    #[test]
    fn test_default_resolver() {
        let resolver = DefaultErrorMessageResolver;
        let msg = resolver.resolve(AgentErrorKind::Timeout, None);
        assert_eq!(msg, "The request timed out");

        let msg = resolver.resolve(AgentErrorKind::ToolError, Some("boom"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }
        fn _returns_error() -> Result<i32> {
            Err(Error::timeout())
        }
    }
}
