//! Stream marker protocol.
//!
//! A streamed chunk is either literal text or a control marker. Markers are
//! encoded as a reserved sentinel (`0x00` followed by the ASCII literal
//! `__arc__`) plus a tagged payload, so that transports which only know how
//! to forward opaque text chunks can still be taught to recognize and
//! translate them, without requiring every hop to understand a richer event
//! type.
//!
//! No normal LLM output begins with the sentinel in practice (it is a NUL
//! byte), so `parse` is unambiguous.

pub(crate) const SENTINEL: &str = "\u{0}__arc__";

/// A decoded stream marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    ToolStart(String),
    ToolEnd(String),
    Error(String),
}

impl Marker {
    /// Encode this marker as the literal chunk text a transport would see.
    pub fn encode(&self) -> String {
        match self {
            Marker::ToolStart(name) => format!("{SENTINEL}tool_start:{name}"),
            Marker::ToolEnd(name) => format!("{SENTINEL}tool_end:{name}"),
            Marker::Error(msg) => format!("{SENTINEL}error:{msg}"),
        }
    }
}

/// One item in the lazy sequence a streaming run emits downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    Marker(Marker),
}

/// Build the literal chunk text for a `tool_start` marker.
pub fn tool_start(name: &str) -> String {
    Marker::ToolStart(name.to_string()).encode()
}

/// Build the literal chunk text for a `tool_end` marker.
pub fn tool_end(name: &str) -> String {
    Marker::ToolEnd(name.to_string()).encode()
}

/// Build the literal chunk text for an `error` marker.
pub fn error_marker(message: &str) -> String {
    Marker::Error(message.to_string()).encode()
}

/// Parse a raw chunk. Returns `None` for any text not beginning with the
/// sentinel — i.e. ordinary model output passes through untouched.
pub fn parse(chunk: &str) -> Option<Marker> {
    let payload = chunk.strip_prefix(SENTINEL)?;
    if let Some(name) = payload.strip_prefix("tool_start:") {
        Some(Marker::ToolStart(name.to_string()))
    } else if let Some(name) = payload.strip_prefix("tool_end:") {
        Some(Marker::ToolEnd(name.to_string()))
    } else if let Some(msg) = payload.strip_prefix("error:") {
        Some(Marker::Error(msg.to_string()))
    } else {
        None
    }
}

/// Classify a raw chunk into the [`StreamChunk`] the engine forwards downstream.
pub fn classify(chunk: String) -> StreamChunk {
    match parse(&chunk) {
        Some(marker) => StreamChunk::Marker(marker),
        None => StreamChunk::Text(chunk),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_round_trip() {
        let name = "weather";
        assert_eq!(parse(&tool_start(name)), Some(Marker::ToolStart(name.to_string())));
        assert_eq!(parse(&tool_end(name)), Some(Marker::ToolEnd(name.to_string())));

        let msg = "boom";
        assert_eq!(parse(&error_marker(msg)), Some(Marker::Error(msg.to_string())));
    }

    #[test]
    fn test_parse_plain_text_is_none() {
        assert_eq!(parse("hello there"), None);
        assert_eq!(parse(""), None);
        assert_eq!(parse("__arc__tool_start:weather"), None); // missing NUL prefix
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("hi".to_string()), StreamChunk::Text("hi".to_string()));
        assert_eq!(
            classify(tool_start("weather")),
            StreamChunk::Marker(Marker::ToolStart("weather".to_string()))
        );
    }

    #[test]
    fn test_no_normal_output_collides() {
        for sample in ["", "tool_start:weather", "error: something", "\u{0}", "__arc__"] {
            assert_eq!(parse(sample), None, "{sample:?} should not parse as a marker");
        }
    }
}
