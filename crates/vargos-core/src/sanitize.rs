// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! History sanitizer: turn limiting, tool_call/tool_result pairing repair,
//! and turn merging, applied before a message list is handed to a model.
//!
//! Grounded in `compact::serialize_history`'s message-walking style and
//! `vargos_tools::ToolOutput`'s error-result construction for the synthetic
//! tool result text.

use vargos_model::{Message, MessageContent, Role, ToolResultContent};

/// Per-session-kind turn limits, keyed by the session-key prefix (
/// grammar: `channel:userId`, `cli:id`, `cron:id`, or a `:subagent:` suffix).
const CHANNEL_TURN_LIMIT: usize = 30;
const CLI_TURN_LIMIT: usize = 50;
const SUBAGENT_OR_CRON_TURN_LIMIT: usize = 10;

/// Resolve the turn limit for a session key using the session-key grammar:
/// `root (":subagent:" id)?`, `root := "cli:" id | "cron:" id | channel ":" userId`.
pub fn turn_limit_for_session_key(session_key: &str) -> usize {
    if vargos_sessions::is_subagent_key(session_key) {
        return SUBAGENT_OR_CRON_TURN_LIMIT;
    }
    if session_key.starts_with("cli:") {
        CLI_TURN_LIMIT
    } else if session_key.starts_with("cron:") {
        SUBAGENT_OR_CRON_TURN_LIMIT
    } else {
        CHANNEL_TURN_LIMIT
    }
}

/// Run the full sanitizer pipeline: repair tool_call/tool_result pairing,
/// merge adjacent same-role turns, then trim to the most recent `turn_limit`
/// turns. System messages are never counted against the limit and always
/// survive at the front of the list.
pub fn sanitize_history(messages: Vec<Message>, turn_limit: usize) -> Vec<Message> {
    let repaired = repair_tool_pairing(messages);
    let merged = merge_turns(repaired);
    limit_turns(merged, turn_limit)
}

/// Ensure every `ToolCall` message is followed by a matching `ToolResult`
/// (by `tool_call_id`) and every `ToolResult` has a preceding `ToolCall`.
///
/// - An unmatched `ToolCall` gets a synthetic error `ToolResult` inserted
///   immediately after it, so the next model request never sees a dangling
///   call (providers reject that shape).
/// - An orphan `ToolResult` (no matching preceding `ToolCall`) is dropped.
pub fn repair_tool_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut pending_call_ids: Vec<String> = Vec::new();

    for msg in messages {
        match &msg.content {
            MessageContent::ToolCall { tool_call_id, .. } => {
                pending_call_ids.push(tool_call_id.clone());
                out.push(msg);
            }
            MessageContent::ToolResult { tool_call_id, .. } => {
                if let Some(pos) = pending_call_ids.iter().position(|id| id == tool_call_id) {
                    pending_call_ids.remove(pos);
                    out.push(msg);
                }
                // else: orphan result, drop it.
            }
            _ => {
                // A non-tool turn closes out any calls still pending: insert
                // synthetic error results for them before the new turn.
                for id in pending_call_ids.drain(..) {
                    out.push(synthetic_error_result(&id));
                }
                out.push(msg);
            }
        }
    }
    for id in pending_call_ids.drain(..) {
        out.push(synthetic_error_result(&id));
    }
    out
}

fn synthetic_error_result(tool_call_id: &str) -> Message {
    Message {
        role: Role::Tool,
        content: MessageContent::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            content: ToolResultContent::Text(
                "Error: tool call was interrupted before a result was produced.".to_string(),
            ),
        },
    }
}

/// Merge adjacent messages with the same role into a single message, except
/// `Tool` (toolResult) messages, which never merge — each carries a distinct
/// `tool_call_id` and must stay addressable.
pub fn merge_turns(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        let mergeable = matches!(msg.role, Role::User | Role::Assistant)
            && matches!(msg.content, MessageContent::Text(_));
        if mergeable {
            if let Some(last) = out.last_mut() {
                if last.role == msg.role {
                    if let (MessageContent::Text(prev), MessageContent::Text(next)) =
                        (&mut last.content, &msg.content)
                    {
                        prev.push_str("\n\n");
                        prev.push_str(next);
                        continue;
                    }
                }
            }
        }
        out.push(msg);
    }
    out
}

/// Keep system messages plus the most recent `turn_limit` *user* turns, along
/// with everything between them (assistant replies, tool calls/results). A
/// turn limit of `0` disables limiting (returns input unchanged).
pub fn limit_turns(messages: Vec<Message>, turn_limit: usize) -> Vec<Message> {
    if turn_limit == 0 {
        return messages;
    }
    let (system, rest): (Vec<Message>, Vec<Message>) =
        messages.into_iter().partition(|m| matches!(m.role, Role::System));

    let user_count = rest.iter().filter(|m| matches!(m.role, Role::User)).count();
    if user_count <= turn_limit {
        let mut out = system;
        out.extend(rest);
        return out;
    }

    // Find the index of the `turn_limit`-th-most-recent user message and keep
    // everything from there forward, so interleaved assistant/toolResult
    // messages stay attached to the user turn that produced them.
    let skip_user_turns = user_count - turn_limit;
    let mut seen = 0;
    let mut keep_from = rest.len();
    for (i, msg) in rest.iter().enumerate() {
        if matches!(msg.role, Role::User) {
            if seen == skip_user_turns {
                keep_from = i;
                break;
            }
            seen += 1;
        }
    }

    let mut out = system;
    out.extend(rest.into_iter().skip(keep_from));
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use vargos_model::FunctionCall;

    fn tool_call(id: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.to_string(),
                function: FunctionCall { name: "read_file".to_string(), arguments: "{}".to_string() },
            },
        }
    }

    #[test]
    fn turn_limit_channel_key_is_30() {
        assert_eq!(turn_limit_for_session_key("whatsapp:u1"), CHANNEL_TURN_LIMIT);
    }

    #[test]
    fn turn_limit_cli_key_is_50() {
        assert_eq!(turn_limit_for_session_key("cli:1"), CLI_TURN_LIMIT);
    }

    #[test]
    fn turn_limit_cron_key_is_10() {
        assert_eq!(turn_limit_for_session_key("cron:daily-report"), SUBAGENT_OR_CRON_TURN_LIMIT);
    }

    #[test]
    fn turn_limit_subagent_key_is_10_even_under_channel_root() {
        assert_eq!(
            turn_limit_for_session_key("whatsapp:u1:subagent:abc"),
            SUBAGENT_OR_CRON_TURN_LIMIT
        );
    }

    #[test]
    fn repair_keeps_matched_call_and_result() {
        let msgs = vec![
            tool_call("a"),
            Message::tool_result("a", "ok"),
        ];
        let out = repair_tool_pairing(msgs);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn repair_inserts_synthetic_result_for_unmatched_call() {
        let msgs = vec![tool_call("a"), Message::user("next turn")];
        let out = repair_tool_pairing(msgs);
        assert_eq!(out.len(), 3);
        match &out[1].content {
            MessageContent::ToolResult { tool_call_id, .. } => assert_eq!(tool_call_id, "a"),
            other => panic!("expected synthetic tool result, got {other:?}"),
        }
    }

    #[test]
    fn repair_inserts_synthetic_result_at_end_of_history() {
        let msgs = vec![tool_call("a")];
        let out = repair_tool_pairing(msgs);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1].content, MessageContent::ToolResult { .. }));
    }

    #[test]
    fn repair_drops_orphan_result() {
        let msgs = vec![Message::user("hi"), Message::tool_result("ghost", "stale")];
        let out = repair_tool_pairing(msgs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_text(), Some("hi"));
    }

    #[test]
    fn merge_combines_adjacent_user_turns() {
        let msgs = vec![Message::user("first"), Message::user("second")];
        let out = merge_turns(msgs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_text(), Some("first\n\nsecond"));
    }

    #[test]
    fn merge_combines_adjacent_assistant_turns() {
        let msgs = vec![Message::assistant("a"), Message::assistant("b")];
        let out = merge_turns(msgs);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn merge_does_not_combine_user_and_assistant() {
        let msgs = vec![Message::user("hi"), Message::assistant("hello")];
        let out = merge_turns(msgs);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn merge_never_combines_tool_results() {
        let msgs = vec![Message::tool_result("a", "one"), Message::tool_result("b", "two")];
        let out = merge_turns(msgs);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn limit_turns_keeps_system_messages_unconditionally() {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..5 {
            msgs.push(Message::user(format!("turn {i}")));
        }
        let out = limit_turns(msgs, 2);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out.len(), 3); // 1 system + 2 kept
    }

    #[test]
    fn limit_turns_keeps_most_recent() {
        let msgs = vec![Message::user("old"), Message::user("mid"), Message::user("new")];
        let out = limit_turns(msgs, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_text(), Some("new"));
    }

    #[test]
    fn limit_turns_counts_user_turns_not_raw_messages() {
        // Each user turn is followed by an assistant reply, so raw message
        // count is double the user-turn count.
        let mut msgs = Vec::new();
        for i in 0..80 {
            msgs.push(Message::user(format!("user turn {i}")));
            msgs.push(Message::assistant(format!("assistant reply {i}")));
        }
        let out = limit_turns(msgs, 50);
        let user_msgs: Vec<_> = out.iter().filter(|m| matches!(m.role, Role::User)).collect();
        assert_eq!(user_msgs.len(), 50);
        assert_eq!(user_msgs.first().unwrap().as_text(), Some("user turn 30"));
        assert_eq!(user_msgs.last().unwrap().as_text(), Some("user turn 79"));
    }

    #[test]
    fn limit_turns_keeps_tool_messages_between_kept_user_turns() {
        let msgs = vec![
            Message::user("old"),
            tool_call("a"),
            Message::tool_result("a", "ok"),
            Message::assistant("old reply"),
            Message::user("new"),
            Message::assistant("new reply"),
        ];
        let out = limit_turns(msgs, 1);
        // Only the "new" user turn and everything after it survives; the
        // tool_call/tool_result pair attached to the dropped "old" turn goes
        // with it.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_text(), Some("new"));
        assert_eq!(out[1].as_text(), Some("new reply"));
    }

    #[test]
    fn limit_turns_noop_when_under_limit() {
        let msgs = vec![Message::user("a"), Message::user("b")];
        let out = limit_turns(msgs.clone(), 10);
        assert_eq!(out.len(), msgs.len());
    }

    #[test]
    fn sanitize_history_runs_full_pipeline() {
        let msgs = vec![
            Message::user("a"),
            Message::user("b"),
            tool_call("x"),
            Message::tool_result("x", "done"),
            Message::assistant("c"),
        ];
        let out = sanitize_history(msgs, 50);
        // user "a"+"b" merged, then tool_call, tool_result, assistant "c"
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].as_text(), Some("a\n\nb"));
    }
}
