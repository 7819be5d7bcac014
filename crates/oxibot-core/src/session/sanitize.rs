//! Pure functions over a message sequence: orphan-result removal,
//! dangling tool-call interruption recovery, and trim-to-budget.
//!
//! Kept free of I/O and async so the sanitization invariant (every
//! `tool` message has a matching prior `assistant` tool call) is cheap
//! to exercise directly in tests.

use crate::types::Message;

/// Sentinel content injected for an assistant tool-call left unresolved
/// across a process restart or a dropped turn.
pub const INTERRUPTED_TOOL_SENTINEL: &str = "[Tool call interrupted before a result was recorded]";

/// Sentinel prefix marking a message as a rolling summary of evicted history.
pub const SUMMARY_SENTINEL: &str = "[CONVERSATION SUMMARY]\n";

/// Drop `tool` messages with no matching prior `assistant` tool call, and
/// append a synthetic `tool` message for any trailing assistant tool call
/// left unresolved. Must run before every LLM call.
pub fn sanitize(messages: &[Message]) -> Vec<Message> {
    use std::collections::HashSet;

    let mut known_call_ids: HashSet<&str> = HashSet::new();
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg {
            Message::Assistant {
                tool_calls: Some(calls),
                ..
            } => {
                for call in calls {
                    known_call_ids.insert(call.id.as_str());
                }
                out.push(msg.clone());
            }
            Message::Tool { tool_call_id, .. } => {
                if known_call_ids.remove(tool_call_id.as_str()) {
                    out.push(msg.clone());
                }
                // orphaned tool result: drop silently
            }
            other => out.push(other.clone()),
        }
    }

    // Any call id still pending after the full pass had no matching tool
    // response anywhere in history — synthesize an interruption record.
    if !known_call_ids.is_empty() {
        let pending_ids: Vec<String> = if let Some(Message::Assistant {
            tool_calls: Some(calls),
            ..
        }) = out.last()
        {
            calls
                .iter()
                .filter(|call| known_call_ids.contains(call.id.as_str()))
                .map(|call| call.id.clone())
                .collect()
        } else {
            Vec::new()
        };

        for id in pending_ids {
            out.push(Message::tool_result(id, INTERRUPTED_TOOL_SENTINEL));
        }
    }

    out
}

/// Drop the oldest messages (keeping `system` messages) until at most
/// `max_messages` non-system messages remain. Simple tail-keep eviction,
/// used directly when no summarizer is configured and as the fallback
/// path when a summarization pass is already in flight for this history.
pub fn trim_tail_keep(messages: Vec<Message>, max_messages: usize) -> Vec<Message> {
    let non_system_count = messages
        .iter()
        .filter(|m| !matches!(m, Message::System { .. }))
        .count();
    if non_system_count <= max_messages {
        return messages;
    }

    let mut to_drop = non_system_count - max_messages;
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        if to_drop > 0 && !matches!(msg, Message::System { .. }) {
            to_drop -= 1;
            continue;
        }
        out.push(msg);
    }
    out
}

/// Split off the oldest ~40% of non-system messages for summarization,
/// returning `(to_summarize, remainder)`. Only called when eviction is
/// about to happen and a summarizer is configured.
pub fn split_for_summary(messages: Vec<Message>) -> (Vec<Message>, Vec<Message>) {
    let non_system_count = messages
        .iter()
        .filter(|m| !matches!(m, Message::System { .. }))
        .count();
    let target = (non_system_count as f64 * 0.4).ceil() as usize;

    let mut to_summarize = Vec::new();
    let mut remainder = Vec::new();
    let mut taken = 0usize;
    for msg in messages {
        if taken < target && !matches!(msg, Message::System { .. }) {
            taken += 1;
            to_summarize.push(msg);
        } else {
            remainder.push(msg);
        }
    }
    (to_summarize, remainder)
}

/// Build the synthetic leading system message that replaces summarized history.
pub fn summary_message(summary_text: &str) -> Message {
    Message::system(format!("{SUMMARY_SENTINEL}{summary_text}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn test_sanitize_keeps_matched_tool_result() {
        let messages = vec![
            Message::user("run it"),
            Message::assistant_tool_calls(vec![ToolCall::new("call_1", "exec", "{}")]),
            Message::tool_result("call_1", "ok"),
        ];
        let out = sanitize(&messages);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_sanitize_drops_orphan_tool_result() {
        let messages = vec![
            Message::user("hi"),
            Message::tool_result("call_ghost", "orphaned"),
            Message::assistant("hello"),
        ];
        let out = sanitize(&messages);
        assert_eq!(out.len(), 2);
        assert!(!out
            .iter()
            .any(|m| matches!(m, Message::Tool { tool_call_id, .. } if tool_call_id == "call_ghost")));
    }

    #[test]
    fn test_sanitize_injects_synthetic_tool_for_dangling_call() {
        let messages = vec![
            Message::user("run it"),
            Message::assistant_tool_calls(vec![ToolCall::new("call_1", "exec", "{}")]),
        ];
        let out = sanitize(&messages);
        assert_eq!(out.len(), 3);
        match out.last().unwrap() {
            Message::Tool {
                content,
                tool_call_id,
            } => {
                assert_eq!(tool_call_id, "call_1");
                assert_eq!(content, INTERRUPTED_TOOL_SENTINEL);
            }
            _ => panic!("expected synthetic tool message"),
        }
    }

    #[test]
    fn test_trim_tail_keep_preserves_system_messages() {
        let mut messages = vec![Message::system("persona")];
        for i in 0..10 {
            messages.push(Message::user(format!("msg {i}")));
        }
        let trimmed = trim_tail_keep(messages, 3);
        let system_count = trimmed
            .iter()
            .filter(|m| matches!(m, Message::System { .. }))
            .count();
        assert_eq!(system_count, 1);
        assert_eq!(trimmed.len(), 4);
    }

    #[test]
    fn test_trim_tail_keep_noop_under_budget() {
        let messages = vec![Message::user("a"), Message::user("b")];
        let trimmed = trim_tail_keep(messages.clone(), 10);
        assert_eq!(trimmed, messages);
    }

    #[test]
    fn test_split_for_summary_roughly_forty_percent() {
        let messages: Vec<Message> = (0..10).map(|i| Message::user(format!("m{i}"))).collect();
        let (to_summarize, remainder) = split_for_summary(messages);
        assert_eq!(to_summarize.len(), 4);
        assert_eq!(remainder.len(), 6);
    }

    #[test]
    fn test_summary_message_has_sentinel() {
        let msg = summary_message("the user asked about X and Y");
        match msg {
            Message::System { content } => assert!(content.starts_with(SUMMARY_SENTINEL)),
            _ => panic!("expected system message"),
        }
    }
}
