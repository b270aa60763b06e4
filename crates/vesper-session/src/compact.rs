//! Compaction — archives the oldest slice of a long session to a sibling
//! `.history.jsonl` file, asks the `quick` role for a summary (with a
//! fallback to `default`), and replaces the discarded slice with that
//! summary. `sanitize_orphans` enforces the tool-call/tool-result pairing
//! invariant on whatever slice survives.
//!
//! Runs as a synchronous step inside the turn loop, ahead of the atomic
//! persist, since a session here is an in-process object rather than a
//! row set re-queried from a database. The one exception is the final
//! graph-extraction hand-off, which is spawned rather than awaited so a
//! slow extractor never stalls the turn.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use vesper_core::collaborators::{GraphExtractor, Journal, JournalSection};
use vesper_core::cost::CostLedger;
use vesper_core::persist::append_jsonl;
use vesper_provider::provider::{ChatRequest, Message as WireMessage, ChatMessageRole};
use vesper_provider::registry::ProviderRegistry;

use crate::types::Message;

pub const MAX_MESSAGES_BEFORE_COMPACT: usize = 30;
pub const KEEP_RECENT_MESSAGES: usize = 10;

/// Advance from `len - keep` until hitting a message that is a real user
/// turn (not a tool-result carrier), guaranteeing the retained slice never
/// opens on a turn that references tool calls from the discarded slice.
/// Returns `None` if no such index exists before the end of the vector.
pub fn safe_split_index(messages: &[Message], keep: usize) -> Option<usize> {
    if messages.len() <= keep {
        return None;
    }
    let mut idx = messages.len() - keep;
    while idx < messages.len() {
        if messages[idx].is_real_user_turn() {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

/// Drop any tool-result-only turn that references a tool-call ID absent
/// from the retained assistant turns, and any such O-dialect turn likewise
/// (the domain type has no separate O-dialect turn — both dialects map
/// onto `Message::UserToolResults` at this layer, see `types::Message`).
pub fn sanitize_orphans(recent: &[Message]) -> Vec<Message> {
    let mut live_ids: HashSet<&str> = HashSet::new();
    for m in recent {
        live_ids.extend(m.tool_call_ids());
    }
    recent
        .iter()
        .filter(|m| match m {
            Message::UserToolResults { pairs } => {
                pairs.iter().all(|p| live_ids.contains(p.tool_call_id.as_str()))
            }
            _ => true,
        })
        .cloned()
        .collect()
}

fn transcript(discarded: &[Message]) -> String {
    discarded
        .iter()
        .map(|m| match m {
            Message::UserText { text } => format!("USER: {text}"),
            Message::UserToolResults { pairs } => format!(
                "TOOL_RESULTS: {}",
                pairs.iter().map(|p| p.content.as_str()).collect::<Vec<_>>().join(" | ")
            ),
            Message::AssistantText { text } => format!("ASSISTANT: {text}"),
            Message::AssistantWithToolCalls { text, calls } => format!(
                "ASSISTANT: {} [calls: {}]",
                text.clone().unwrap_or_default(),
                calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
            ),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

const SUMMARY_PROMPT: &str = "Summarize the conversation slice below. Cover: topics discussed, \
people mentioned, decisions made, problems encountered, and tools used. Be concise — a few \
sentences, not a transcript.";

async fn summarize(
    providers: &ProviderRegistry,
    cost_ledger: &tokio::sync::Mutex<CostLedger>,
    today: &str,
    role: &str,
    discarded: &[Message],
) -> Option<String> {
    let req = ChatRequest {
        model: providers.model_for(role),
        system: SUMMARY_PROMPT.to_string(),
        system_prompt: None,
        messages: vec![WireMessage {
            role: ChatMessageRole::User,
            content: transcript(discarded),
        }],
        max_tokens: 512,
        stream: false,
        tools: Vec::new(),
        raw_messages: None,
    };
    match providers.chat(role, &req, cost_ledger, today).await {
        Ok(resp) if !resp.content.trim().is_empty() => Some(resp.content),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, role, "compaction: summarization call failed");
            None
        }
    }
}

/// Run compaction on `messages` in place if the threshold is exceeded.
/// Returns `true` if compaction actually ran.
pub async fn compact_if_needed(
    session_id: &str,
    messages: &mut Vec<Message>,
    archive_path: &Path,
    providers: &ProviderRegistry,
    cost_ledger: &tokio::sync::Mutex<CostLedger>,
    today: &str,
    journal: &dyn Journal,
    graph: &Arc<dyn GraphExtractor>,
) -> bool {
    if messages.len() <= MAX_MESSAGES_BEFORE_COMPACT {
        return false;
    }

    let Some(split) = safe_split_index(messages, KEEP_RECENT_MESSAGES) else {
        warn!(session = session_id, "compaction: no safe split index found, skipping this tick");
        return false;
    };

    let discarded: Vec<Message> = messages[..split].to_vec();
    let recent: Vec<Message> = messages[split..].to_vec();

    for msg in &discarded {
        if let Err(e) = append_jsonl(archive_path, msg) {
            warn!(error = %e, session = session_id, "compaction: failed to archive a message");
        }
    }

    let summary = match summarize(providers, cost_ledger, today, "quick", &discarded).await {
        Some(s) => Some(s),
        None => summarize(providers, cost_ledger, today, "default", &discarded).await,
    };

    let sanitized_recent = sanitize_orphans(&recent);

    *messages = match summary {
        Some(summary) => {
            let note = format!(
                "[Conversation summary]\n{summary}\n[Full history archived in {session_id}.history.jsonl — {} messages]",
                discarded.len()
            );
            let mut rebuilt = vec![Message::AssistantText { text: note }];
            rebuilt.extend(sanitized_recent);
            rebuilt
        }
        None => sanitized_recent,
    };

    let _ = journal
        .append_entry(
            &format!("Compacted session {session_id}: archived {} messages", discarded.len()),
            JournalSection::Notes,
        )
        .await;

    let summary_for_graph = messages
        .first()
        .and_then(|m| match m {
            Message::AssistantText { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default();
    if !summary_for_graph.is_empty() {
        // Fire-and-forget per spec: extraction must never block the turn
        // that triggered compaction or bubble its errors back here.
        let graph = graph.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            graph.extract(&session_id, &summary_for_graph, serde_json::json!({"kind": "compaction"})).await;
        });
    }

    info!(session = session_id, archived = discarded.len(), retained = messages.len(), "compaction complete");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallRecord, ToolResultPair};

    fn user(text: &str) -> Message {
        Message::UserText { text: text.to_string() }
    }

    #[test]
    fn safe_split_finds_real_user_turn() {
        let messages = vec![
            user("hi"),
            Message::AssistantText { text: "hello".into() },
            user("what's the weather"),
            Message::AssistantWithToolCalls {
                text: None,
                calls: vec![ToolCallRecord {
                    id: "t1".into(),
                    name: "get_weather".into(),
                    arguments: serde_json::json!({}),
                }],
            },
            Message::UserToolResults {
                pairs: vec![ToolResultPair { tool_call_id: "t1".into(), content: "sunny".into() }],
            },
            Message::AssistantText { text: "it's sunny".into() },
            user("thanks"),
        ];
        let idx = safe_split_index(&messages, 3).unwrap();
        // keep window starts at len-3=4 (UserToolResults, not real) -> advances to 6 (user "thanks")
        assert!(messages[idx].is_real_user_turn());
    }

    #[test]
    fn safe_split_returns_none_when_too_short() {
        let messages = vec![user("hi")];
        assert!(safe_split_index(&messages, 10).is_none());
    }

    #[test]
    fn sanitize_orphans_drops_dangling_tool_results() {
        let recent = vec![
            Message::UserToolResults {
                pairs: vec![ToolResultPair { tool_call_id: "ghost".into(), content: "x".into() }],
            },
            user("hello"),
        ];
        let sanitized = sanitize_orphans(&recent);
        assert_eq!(sanitized.len(), 1);
        assert!(sanitized[0].is_real_user_turn());
    }

    #[test]
    fn sanitize_orphans_keeps_paired_tool_results() {
        let recent = vec![
            Message::AssistantWithToolCalls {
                text: None,
                calls: vec![ToolCallRecord { id: "t1".into(), name: "x".into(), arguments: serde_json::json!({}) }],
            },
            Message::UserToolResults {
                pairs: vec![ToolResultPair { tool_call_id: "t1".into(), content: "ok".into() }],
            },
        ];
        let sanitized = sanitize_orphans(&recent);
        assert_eq!(sanitized.len(), 2);
    }
}
