//! Core data model: the public contract visible across the engine boundary.
//!
//! Three groups of types live here:
//!
//! - Validated newtypes ([`ModelName`], [`BaseUrl`], [`Temperature`]),
//!   carried over from the bundled provider configuration.
//! - The conversation model ([`Message`], [`MessageRole`], [`ToolCall`],
//!   [`MediaAttachment`]).
//! - The per-request contract ([`AgentCommand`], [`AgentResult`],
//!   [`TokenUsage`]) and the small context structs policy stages consume
//!   ([`GuardCommand`], [`OutputGuardContext`]).

use crate::error::{AgentErrorKind, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// NEWTYPE WRAPPERS FOR COMPILE-TIME TYPE SAFETY
// ============================================================================

/// Validated model name.
///
/// # Example
/// ```
/// use agent_core::ModelName;
/// let model = ModelName::new("qwen2.5-32b-instruct").unwrap();
/// assert_eq!(model.as_str(), "qwen2.5-32b-instruct");
/// assert!(ModelName::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelName(String);

impl ModelName {
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_input("Model name cannot be empty or whitespace"));
        }
        Ok(ModelName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated base URL (must start with `http://` or `https://`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseUrl(String);

impl BaseUrl {
    pub fn new(url: impl Into<String>) -> crate::Result<Self> {
        let url = url.into();
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_input("base_url cannot be empty"));
        }
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(Error::invalid_input("base_url must start with http:// or https://"));
        }
        Ok(BaseUrl(url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated sampling temperature, `0.0..=2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature(f32);

impl Temperature {
    pub fn new(temp: f32) -> crate::Result<Self> {
        if !(0.0..=2.0).contains(&temp) {
            return Err(Error::invalid_input("temperature must be between 0.0 and 2.0"));
        }
        Ok(Temperature(temp))
    }

    pub fn value(&self) -> f32 {
        self.0
    }

    /// Cache-eligibility helper: the response cache only serves calls whose
    /// temperature is exactly zero (deterministic turns).
    pub fn is_deterministic(&self) -> bool {
        self.0 == 0.0
    }
}

impl std::fmt::Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// CONVERSATION MODEL
// ============================================================================

/// Who produced a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model inside an `Assistant` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments string as emitted by the model; parsed on demand
    /// by [`crate::codec`].
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Exactly one of base64 `data` or a `uri` — enforced by construction rather
/// than by a runtime check against two optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MediaSource {
    Data(String),
    Uri(String),
}

/// A media attachment carried on an [`AgentCommand`] or [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub source: MediaSource,
    pub mime_type: String,
}

impl MediaAttachment {
    /// Build an attachment from base64-encoded bytes.
    pub fn from_data(data: impl Into<String>, mime_type: impl Into<String>) -> crate::Result<Self> {
        let data = data.into();
        let mime_type = mime_type.into();
        if data.is_empty() {
            return Err(Error::invalid_input("media data cannot be empty"));
        }
        if !mime_type.starts_with("image/") && !mime_type.starts_with("audio/") && !mime_type.starts_with("video/") {
            return Err(Error::invalid_input("mime_type must start with image/, audio/ or video/"));
        }
        Ok(Self { source: MediaSource::Data(data), mime_type })
    }

    /// Build an attachment from a remote or data URI.
    pub fn from_uri(uri: impl Into<String>, mime_type: impl Into<String>) -> crate::Result<Self> {
        let uri = uri.into();
        if uri.is_empty() {
            return Err(Error::invalid_input("media uri cannot be empty"));
        }
        Ok(Self { source: MediaSource::Uri(uri), mime_type: mime_type.into() })
    }
}

/// A single turn in the conversation history.
///
/// Pair integrity invariant: every `Assistant` message with `tool_calls` set
/// must, in any persisted history, be immediately followed by one `Tool`
/// message per call with a matching `tool_call_id`. [`crate::trimmer`]
/// enforces this when bounding the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    /// Set only on `Assistant` messages that requested tool calls.
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Set only on `Tool` messages; references the originating `ToolCall::id`.
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            timestamp: now_millis(),
            media: Vec::new(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: now_millis(),
            media: Vec::new(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user_with_media(content: impl Into<String>, media: Vec<MediaAttachment>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: now_millis(),
            media,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: now_millis(),
            media: Vec::new(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: now_millis(),
            media: Vec::new(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            timestamp: now_millis(),
            media: Vec::new(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

// ============================================================================
// AGENT COMMAND / RESULT
// ============================================================================

/// Execution strategy requested for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentMode {
    /// A single LLM call, no tool use.
    Standard,
    /// The full bounded ReAct tool-calling loop (batch).
    React,
    /// The ReAct loop, streamed.
    Streaming,
}

/// Requested shape of the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseFormat {
    Text,
    Json,
    Yaml,
}

/// Well-known metadata keys understood by the engine; transports may set
/// additional arbitrary keys.
pub mod metadata_keys {
    pub const SESSION_ID: &str = "sessionId";
    pub const TENANT_ID: &str = "tenantId";
    pub const CHANNEL: &str = "channel";
    pub const AGENT_NAME: &str = "agentName";
    pub const RAG_FILTERS: &str = "ragFilters";
}

/// Immutable per-request command produced by a transport adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommand {
    pub system_prompt: String,
    pub user_prompt: String,
    pub mode: AgentMode,
    pub model: Option<ModelName>,
    pub conversation_history: Vec<Message>,
    pub temperature: Option<Temperature>,
    pub max_tool_calls: u32,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub response_format: ResponseFormat,
    pub response_schema: Option<serde_json::Value>,
    pub media: Vec<MediaAttachment>,
}

impl AgentCommand {
    pub fn builder(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> AgentCommandBuilder {
        AgentCommandBuilder::new(system_prompt, user_prompt)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get(metadata_keys::SESSION_ID).and_then(|v| v.as_str())
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata.get(metadata_keys::TENANT_ID).and_then(|v| v.as_str())
    }

    pub fn channel(&self) -> Option<&str> {
        self.metadata.get(metadata_keys::CHANNEL).and_then(|v| v.as_str())
    }

    /// Cache eligibility: see DESIGN.md open-question decision. Only
    /// deterministic (temperature==0 or unset), tool-free, non-streaming
    /// commands are eligible.
    pub fn is_cache_eligible(&self, declares_tools: bool) -> bool {
        if self.mode == AgentMode::Streaming {
            return false;
        }
        if declares_tools {
            return false;
        }
        match &self.temperature {
            Some(t) => t.is_deterministic(),
            None => true,
        }
    }
}

/// Builder for [`AgentCommand`], mirroring the validate-on-build pattern used
/// throughout this crate's configuration types.
#[derive(Debug, Clone)]
pub struct AgentCommandBuilder {
    system_prompt: String,
    user_prompt: String,
    mode: AgentMode,
    model: Option<ModelName>,
    conversation_history: Vec<Message>,
    temperature: Option<Temperature>,
    max_tool_calls: u32,
    user_id: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
    response_format: ResponseFormat,
    response_schema: Option<serde_json::Value>,
    media: Vec<MediaAttachment>,
}

impl AgentCommandBuilder {
    fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            mode: AgentMode::React,
            model: None,
            conversation_history: Vec::new(),
            temperature: None,
            max_tool_calls: 10,
            user_id: None,
            metadata: HashMap::new(),
            response_format: ResponseFormat::Text,
            response_schema: None,
            media: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn model(mut self, model: ModelName) -> Self {
        self.model = Some(model);
        self
    }

    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.conversation_history = history;
        self
    }

    pub fn temperature(mut self, temperature: Temperature) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tool_calls(mut self, max: u32) -> Self {
        self.max_tool_calls = max;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn media(mut self, media: Vec<MediaAttachment>) -> Self {
        self.media = media;
        self
    }

    pub fn build(self) -> AgentCommand {
        AgentCommand {
            system_prompt: self.system_prompt,
            user_prompt: self.user_prompt,
            mode: self.mode,
            model: self.model,
            conversation_history: self.conversation_history,
            temperature: self.temperature,
            max_tool_calls: self.max_tool_calls,
            user_id: self.user_id,
            metadata: self.metadata,
            response_format: self.response_format,
            response_schema: self.response_schema,
            media: self.media,
        }
    }
}

/// Token accounting for a completed call. Not populated for streaming runs
/// (known gap, spec.md §4.13 — never fabricated).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Sole observable outcome of a batch `execute` call.
///
/// Invariant: `success ⇒ content.is_some()`; `!success ⇒ error_code.is_some()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub content: Option<String>,
    pub error_code: Option<AgentErrorKind>,
    pub error_message: Option<String>,
    pub tools_used: Vec<String>,
    pub token_usage: Option<TokenUsage>,
    pub duration_ms: u64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentResult {
    pub fn success(content: impl Into<String>, tools_used: Vec<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error_code: None,
            error_message: None,
            tools_used,
            token_usage: None,
            duration_ms,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error_code: AgentErrorKind, error_message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            content: None,
            error_code: Some(error_code),
            error_message: Some(error_message.into()),
            tools_used: Vec::new(),
            token_usage: None,
            duration_ms,
            metadata: HashMap::new(),
        }
    }

    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ============================================================================
// GUARD CONTEXTS
// ============================================================================

/// The minimum an input (or output, via [`OutputGuardContext`]) policy stage
/// needs to make a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardCommand {
    pub text: String,
    pub user_id: Option<String>,
    pub channel: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GuardCommand {
    pub fn from_agent_command(cmd: &AgentCommand) -> Self {
        Self {
            text: cmd.user_prompt.clone(),
            user_id: cmd.user_id.clone(),
            channel: cmd.channel().map(|s| s.to_string()),
            metadata: cmd.metadata.clone(),
        }
    }
}

/// Context handed to output guard stages: the candidate output plus the run
/// summary accumulated so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputGuardContext {
    pub command: GuardCommand,
    pub tools_used: Vec<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_validation() {
        assert!(ModelName::new("qwen2.5").is_ok());
        assert!(ModelName::new("").is_err());
        assert!(ModelName::new("   ").is_err());
    }

    #[test]
    fn test_base_url_validation() {
        assert!(BaseUrl::new("http://localhost:1234/v1").is_ok());
        assert!(BaseUrl::new("localhost:1234").is_err());
        assert!(BaseUrl::new("").is_err());
    }

    #[test]
    fn test_temperature_validation() {
        assert!(Temperature::new(0.0).is_ok());
        assert!(Temperature::new(2.0).is_ok());
        assert!(Temperature::new(-0.1).is_err());
        assert!(Temperature::new(2.1).is_err());
        assert!(Temperature::new(0.0).unwrap().is_deterministic());
        assert!(!Temperature::new(0.5).unwrap().is_deterministic());
    }

    #[test]
    fn test_media_attachment_requires_nonempty() {
        assert!(MediaAttachment::from_data("", "image/png").is_err());
        assert!(MediaAttachment::from_data("abc", "text/plain").is_err());
        assert!(MediaAttachment::from_data("abc", "image/png").is_ok());
        assert!(MediaAttachment::from_uri("https://x/y.png", "image/png").is_ok());
    }

    #[test]
    fn test_message_pair_shape() {
        let asst = Message::assistant_with_tool_calls(
            "checking",
            vec![ToolCall::new("call_1", "weather", "{}")],
        );
        assert!(asst.has_tool_calls());

        let tool_msg = Message::tool("call_1", "sunny");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_agent_command_builder_defaults() {
        let cmd = AgentCommand::builder("be helpful", "hello").build();
        assert_eq!(cmd.mode, AgentMode::React);
        assert_eq!(cmd.max_tool_calls, 10);
        assert!(cmd.is_cache_eligible(false));
    }

    #[test]
    fn test_cache_eligibility() {
        let cmd = AgentCommand::builder("sys", "hi")
            .temperature(Temperature::new(0.7).unwrap())
            .build();
        assert!(!cmd.is_cache_eligible(false));

        let streaming = AgentCommand::builder("sys", "hi").mode(AgentMode::Streaming).build();
        assert!(!streaming.is_cache_eligible(false));
    }

    #[test]
    fn test_agent_result_invariants() {
        let ok = AgentResult::success("hi", vec![], 5);
        assert!(ok.success && ok.content.is_some());

        let err = AgentResult::failure(AgentErrorKind::Timeout, "too slow", 5);
        assert!(!err.success && err.error_code.is_some());
    }

    #[test]
    fn test_metadata_accessors() {
        let cmd = AgentCommand::builder("sys", "hi")
            .metadata(metadata_keys::SESSION_ID, serde_json::json!("s-1"))
            .build();
        assert_eq!(cmd.session_id(), Some("s-1"));
    }
}
