//! Bundled `ChatModel` implementation against OpenAI-compatible local
//! servers (LM Studio, Ollama, llama.cpp, vLLM — see `config.rs`).
//!
//! Owns the OpenAI wire format end to end: request building, response
//! parsing, and the streaming delta shapes consumed by
//! [`crate::utils::ToolCallAggregator`] to produce
//! [`crate::capabilities::ChatResponse`] and [`crate::capabilities::ChatChunk`].

use crate::capabilities::{ChatCallOptions, ChatChunk, ChatModel, ChatResponse, ChatStream};
use crate::error::{Error, Result};
use crate::types::{Message, MessageRole, ToolCall};
use crate::utils::{ToolCallAggregator, parse_sse_stream};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OpenAiMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCallOut>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OpenAiToolCallOut {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAiFunctionOut,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OpenAiFunctionOut {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiCompletion {
    pub choices: Vec<OpenAiCompletionChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiCompletionChoice {
    pub message: OpenAiResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCallIn>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiToolCallIn {
    pub id: String,
    pub function: OpenAiFunctionIn,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiFunctionIn {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One SSE chunk of a streaming chat completion.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiChunk {
    pub choices: Vec<OpenAiChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiChunkChoice {
    pub delta: OpenAiDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct OpenAiDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OpenAiFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

fn to_wire_messages(system: &str, messages: &[Message]) -> Vec<OpenAiMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        out.push(OpenAiMessage { role: "system".into(), content: system.to_string(), tool_calls: None, tool_call_id: None });
    }
    for m in messages {
        let tool_calls = m.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| OpenAiToolCallOut {
                    id: c.id.clone(),
                    call_type: "function".into(),
                    function: OpenAiFunctionOut { name: c.name.clone(), arguments: c.arguments.clone() },
                })
                .collect()
        });
        out.push(OpenAiMessage {
            role: role_str(m.role).to_string(),
            content: m.content.clone(),
            tool_calls,
            tool_call_id: m.tool_call_id.clone(),
        });
    }
    out
}

/// Bundled `ChatModel` talking to any OpenAI-compatible `/chat/completions`
/// endpoint (see `config.rs::Provider` for well-known defaults).
pub struct OpenAiChatModel {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiChatModel {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build().map_err(Error::Http)?;
        Ok(Self { http, base_url: base_url.into(), api_key: api_key.into() })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post(&self, request: &OpenAiRequest) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(Error::api(format!("API error {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn call(&self, system: &str, messages: &[Message], options: &ChatCallOptions) -> Result<ChatResponse> {
        let request = OpenAiRequest {
            model: options.model.clone(),
            messages: to_wire_messages(system, messages),
            stream: false,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools: if options.tools.is_empty() { None } else { Some(options.tools.clone()) },
        };

        let response = self.post(&request).await?;
        let completion: OpenAiCompletion = response.json().await.map_err(Error::Http)?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::api("API response contained no choices"))?;

        let tool_calls = crate::utils::tool_calls_from_wire(choice.message.tool_calls.unwrap_or_default());

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: completion.usage.map(|u| crate::types::TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    fn stream(&self, system: &str, messages: &[Message], options: &ChatCallOptions) -> ChatStream {
        let request = OpenAiRequest {
            model: options.model.clone(),
            messages: to_wire_messages(system, messages),
            stream: true,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools: if options.tools.is_empty() { None } else { Some(options.tools.clone()) },
        };

        let http = self.http.clone();
        let url = self.url();
        let api_key = self.api_key.clone();

        // Connecting is itself async (the POST must be sent before SSE parsing
        // can start), so the connection attempt is folded into a one-shot
        // stream and flattened into the SSE byte stream.
        type ChunkStream = Pin<Box<dyn Stream<Item = Result<OpenAiChunk>> + Send>>;

        let connect = async move {
            let response = http
                .post(&url)
                .header("Authorization", format!("Bearer {api_key}"))
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
                .map_err(Error::Http)?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
                return Err(Error::api(format!("API error {status}: {body}")));
            }
            Ok(parse_sse_stream(response))
        };

        let chunk_stream: ChunkStream = futures::stream::once(connect)
            .flat_map(|result| -> ChunkStream {
                match result {
                    Ok(sse) => sse,
                    Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
                }
            })
            .boxed();

        let aggregated = chunk_stream.scan(ToolCallAggregator::new(), |aggregator, chunk_result| {
            let out: Result<Vec<ChatChunk>> = match chunk_result {
                Ok(chunk) => aggregator.process_chunk(chunk),
                Err(e) => Err(e),
            };
            futures::future::ready(Some(out))
        });

        Box::pin(aggregated.flat_map(|result| {
            futures::stream::iter(match result {
                Ok(chunks) => chunks.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_wire_messages_includes_system_and_roles() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let wire = to_wire_messages("be terse", &messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
    }

    #[test]
    fn test_to_wire_messages_carries_tool_call_id() {
        let messages = vec![Message::tool("call-1", "sunny")];
        let wire = to_wire_messages("", &messages);
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_to_wire_messages_carries_assistant_tool_calls() {
        let tool_call = ToolCall::new("call-1", "weather", "{}");
        let messages = vec![Message::assistant_with_tool_calls("checking", vec![tool_call])];
        let wire = to_wire_messages("", &messages);
        let calls = wire[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "weather");
    }

    #[test]
    fn test_chat_model_new_rejects_bad_timeout_config_gracefully() {
        let model = OpenAiChatModel::new("http://localhost:1234/v1", "key", Duration::from_secs(30));
        assert!(model.is_ok());
    }
}
