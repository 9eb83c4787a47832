//! Tool argument codec.
//!
//! Parses the raw JSON argument string the model attaches to a
//! [`crate::types::ToolCall`] into a `serde_json::Map`. Invalid JSON never
//! fails the outer run — it degrades to an empty map and the tool adapter
//! is left responsible for field-level validation of what it actually
//! received (the same tolerance `ToolCallAggregator` needs for
//! partial/malformed streamed argument text).

use serde_json::{Map, Value};

/// Parse a tool call's raw argument string into a key/value map.
///
/// `""` and syntactically invalid JSON both yield an empty map rather than
/// an error; a valid JSON value that isn't an object is treated the same
/// way, since the tool handler contract expects a map.
pub fn parse_tool_arguments(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_valid_object() {
        let parsed = parse_tool_arguments(r#"{"city": "Seoul"}"#);
        assert_eq!(parsed.get("city"), Some(&json!("Seoul")));
    }

    #[test]
    fn test_empty_string_yields_empty_map() {
        assert!(parse_tool_arguments("").is_empty());
        assert!(parse_tool_arguments("   ").is_empty());
    }

    #[test]
    fn test_invalid_json_yields_empty_map_not_error() {
        assert!(parse_tool_arguments("{not json").is_empty());
        assert!(parse_tool_arguments("null").is_empty());
        assert!(parse_tool_arguments("[1,2,3]").is_empty());
        assert!(parse_tool_arguments(r#""just a string""#).is_empty());
    }
}
