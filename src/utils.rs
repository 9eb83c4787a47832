//! Streaming utilities for SSE parsing and tool call aggregation.
//!
//! Two challenges:
//!
//! 1. **SSE parsing** ([`parse_sse_stream`]): the API returns
//!    `data: {...}\n\n`-framed JSON chunks terminated by `data: [DONE]`.
//! 2. **Tool call delta aggregation** ([`ToolCallAggregator`]): tool calls
//!    arrive as incremental deltas indexed by position, not as complete
//!    objects, and must be assembled before they're usable.
//!
//! Text deltas are forwarded immediately rather than buffered until
//! `finish_reason`; only tool-call assembly waits for the round to finish.

use crate::capabilities::ChatChunk;
use crate::chat_model::{OpenAiChunk, OpenAiFunctionIn, OpenAiToolCallIn};
use crate::types::ToolCall;
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;

/// Aggregates streaming deltas into [`ChatChunk`]s. Text arrives immediately
/// as `ChatChunk::Content`; tool calls accumulate in `tool_calls` until a
/// `finish_reason` flushes them as a single `ChatChunk::Finished`.
pub struct ToolCallAggregator {
    tool_calls: HashMap<u32, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self { tool_calls: HashMap::new() }
    }

    /// Process one chunk, returning zero or more [`ChatChunk`]s: a
    /// `Content` chunk per text delta present, plus a `Finished` chunk
    /// (assembled tool calls, possibly empty) when `finish_reason` appears.
    pub fn process_chunk(&mut self, chunk: OpenAiChunk) -> Result<Vec<ChatChunk>> {
        let mut out = Vec::new();

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    out.push(ChatChunk::Content(content));
                }
            }

            if let Some(tool_calls) = choice.delta.tool_calls {
                for delta in tool_calls {
                    let entry = self.tool_calls.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(args) = function.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }

            if choice.finish_reason.is_some() {
                let mut tool_calls = Vec::new();
                for (_, partial) in self.tool_calls.drain() {
                    if let (Some(id), Some(name)) = (partial.id, partial.name) {
                        tool_calls.push(ToolCall::new(id, name, partial.arguments));
                    }
                }
                out.push(ChatChunk::Finished { tool_calls });
            }
        }

        Ok(out)
    }
}

impl Default for ToolCallAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a raw HTTP response body as a Server-Sent Events stream into
/// [`OpenAiChunk`]s. Non-`data:` lines (heartbeats, comments) are ignored;
/// the `[DONE]` sentinel ends the stream without being parsed as JSON.
pub fn parse_sse_stream(body: reqwest::Response) -> Pin<Box<dyn Stream<Item = Result<OpenAiChunk>> + Send>> {
    let stream = body.bytes_stream().filter_map(move |result| async move {
        let bytes = match result.map_err(Error::Http) {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };

        let text = String::from_utf8_lossy(&bytes);

        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    continue;
                }
                let chunk: OpenAiChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => return Some(Err(Error::stream(format!("failed to parse chunk: {e}")))),
                };
                return Some(Ok(chunk));
            }
        }

        None
    });

    Box::pin(stream)
}

/// Parses a non-streaming completion's assembled tool calls, as a small
/// shared helper between the bundled `call()` path and tests. Kept here
/// rather than duplicated in `chat_model.rs`.
pub(crate) fn tool_calls_from_wire(calls: Vec<OpenAiToolCallIn>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|c| {
            let OpenAiFunctionIn { name, arguments } = c.function;
            ToolCall::new(c.id, name, arguments)
        })
        .collect()
}
