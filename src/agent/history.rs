//! Conversation-history sanitization.
//!
//! Provider APIs hard-reject histories where tool invocations and tool
//! responses do not pair up. Restarts and partial failures can leave
//! orphaned or half-answered tool blocks behind, so replayed history is
//! repaired here before every completion request.

use std::collections::HashMap;

use crate::llm::{ChatMessage, Role};

/// Repair a history so it satisfies the provider's pairing invariant:
///
/// 1. A tool message with no immediately preceding qualifying assistant
///    message is removed.
/// 2. An assistant message declaring tool invocations is kept, together
///    with the contiguous run of tool messages that follows it, only if
///    every declared invocation id is answered exactly once within that
///    run; otherwise the assistant message and the entire run are dropped
///    as a unit.
/// 3. Everything else passes through unchanged, in order.
///
/// Single forward scan; the only lookahead is the contiguous tool run
/// after each qualifying assistant message.
pub fn sanitize(history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(history.len());
    let mut i = 0;

    while i < history.len() {
        let msg = &history[i];
        match msg.role {
            // Any tool message seen here was not consumed as part of a
            // qualifying assistant's run: orphaned, drop it.
            Role::Tool => i += 1,
            Role::Assistant if msg.has_tool_calls() => {
                let run_start = i + 1;
                let mut run_end = run_start;
                while run_end < history.len() && history[run_end].role == Role::Tool {
                    run_end += 1;
                }
                if block_resolved(msg, &history[run_start..run_end]) {
                    out.extend(history[i..run_end].iter().cloned());
                }
                i = run_end;
            }
            _ => {
                out.push(msg.clone());
                i += 1;
            }
        }
    }

    out
}

/// True when every invocation id declared by `assistant` is answered
/// exactly once in `run`, and the run contains nothing else.
fn block_resolved(assistant: &ChatMessage, run: &[ChatMessage]) -> bool {
    let mut answered: HashMap<&str, usize> = assistant
        .tool_calls
        .iter()
        .map(|tc| (tc.id.as_str(), 0))
        .collect();

    for msg in run {
        match msg.tool_call_id.as_deref() {
            Some(id) => match answered.get_mut(id) {
                Some(count) => *count += 1,
                // A response for an id this assistant never declared.
                None => return false,
            },
            None => return false,
        }
    }

    answered.values().all(|&count| count == 1)
}
