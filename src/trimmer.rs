//! Conversation trimmer.
//!
//! Budget-aware, pair-preserving trimming: an assistant message carrying
//! `tool_calls` and its paired tool-result messages are dropped together or
//! kept together, never split, unlike a plain count-based slice.

use crate::types::{Message, MessageRole};

/// Approximate token count for a message list. Character-based (1 token ≈
/// 4 characters) — accurate enough for a budget check, not for billing.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    let mut total_chars = 0;
    for message in messages {
        total_chars += 8;
        total_chars += message.content.len();
        if let Some(tool_calls) = &message.tool_calls {
            for call in tool_calls {
                total_chars += call.name.len() + call.id.len() + call.arguments.len();
            }
        }
    }
    total_chars += 16;
    (total_chars + 3) / 4
}

/// A unit the trimmer keeps or drops atomically: either a single
/// non-tool-call message, or an AssistantMessage-with-tool-calls plus its
/// following ToolMessages.
struct Unit {
    messages: Vec<Message>,
}

impl Unit {
    fn char_len(&self) -> usize {
        self.messages.iter().map(message_char_len).sum()
    }
}

fn message_char_len(m: &Message) -> usize {
    let mut len = 8 + m.content.len();
    if let Some(calls) = &m.tool_calls {
        for c in calls {
            len += c.name.len() + c.id.len() + c.arguments.len();
        }
    }
    len
}

fn group_into_units(messages: &[Message]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        if m.role == MessageRole::Assistant && m.has_tool_calls() {
            let expected = m.tool_calls.as_ref().map(|c| c.len()).unwrap_or(0);
            let mut group = vec![m.clone()];
            let mut j = i + 1;
            let mut collected = 0;
            while j < messages.len() && collected < expected && messages[j].role == MessageRole::Tool {
                group.push(messages[j].clone());
                collected += 1;
                j += 1;
            }
            units.push(Unit { messages: group });
            i = j;
        } else {
            units.push(Unit { messages: vec![m.clone()] });
            i += 1;
        }
    }
    units
}

/// Trim `history` to fit within `char_budget`, preserving tool-call/
/// tool-response pair integrity and always keeping the last UserMessage.
/// `char_budget <= 0` means no trimming. Uses strict inequality: trimming
/// stops as soon as the running total is strictly less than the budget.
pub fn trim_history(history: &[Message], char_budget: i64) -> Vec<Message> {
    if char_budget <= 0 || history.is_empty() {
        return history.to_vec();
    }
    let budget = char_budget as usize;

    let last_user_idx = history.iter().rposition(|m| m.role == MessageRole::User);
    let units = group_into_units(history);

    let last_user_unit_idx = last_user_idx.map(|msg_idx| {
        let mut count = 0;
        for (u, unit) in units.iter().enumerate() {
            let next = count + unit.messages.len();
            if msg_idx >= count && msg_idx < next {
                return u;
            }
            count = next;
        }
        units.len().saturating_sub(1)
    });

    let mut kept = vec![false; units.len()];
    let mut total: usize = 0;

    if let Some(idx) = last_user_unit_idx {
        kept[idx] = true;
        total += units[idx].char_len();
    }

    // Walk from newest to oldest, keeping units while strictly under budget.
    for idx in (0..units.len()).rev() {
        if kept[idx] {
            continue;
        }
        let candidate = total + units[idx].char_len();
        if candidate < budget {
            kept[idx] = true;
            total = candidate;
        }
    }

    units
        .into_iter()
        .zip(kept)
        .filter(|(_, keep)| *keep)
        .flat_map(|(unit, _)| unit.messages)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn test_no_trimming_when_budget_non_positive() {
        let history = vec![Message::user("hi")];
        assert_eq!(trim_history(&history, 0), history);
        assert_eq!(trim_history(&history, -1), history);
    }

    #[test]
    fn test_always_keeps_last_user_message() {
        let history = vec![
            Message::user("old message".repeat(50)),
            Message::assistant("reply".repeat(50)),
            Message::user("latest question"),
        ];
        let trimmed = trim_history(&history, 10);
        assert!(trimmed.iter().any(|m| m.content == "latest question"));
    }

    #[test]
    fn test_tool_call_pair_kept_or_dropped_together() {
        let tool_call = ToolCall { id: "call-1".into(), name: "weather".into(), arguments: "{}".into() };
        let history = vec![
            Message::system("sys"),
            Message::user("what's the weather"),
            Message::assistant_with_tool_calls("", vec![tool_call.clone()]),
            Message::tool("call-1", "sunny"),
            Message::user("thanks"),
        ];
        let trimmed = trim_history(&history, 1_000_000);
        let assistant_present = trimmed.iter().any(|m| m.role == MessageRole::Assistant);
        let tool_present = trimmed.iter().any(|m| m.role == MessageRole::Tool);
        assert_eq!(assistant_present, tool_present);
    }

    #[test]
    fn test_drops_oldest_first() {
        let history = vec![
            Message::user("a".repeat(100)),
            Message::user("b".repeat(100)),
            Message::user("c".repeat(100)),
        ];
        let trimmed = trim_history(&history, 150);
        assert!(!trimmed.iter().any(|m| m.content.starts_with('a')));
    }

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(&[]), 0);
    }
}
