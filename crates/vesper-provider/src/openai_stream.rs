use std::collections::BTreeMap;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Accumulated state for one tool call slot while its argument string is
/// split across multiple deltas, keyed by the `index` OpenAI assigns to
/// each entry in the `tool_calls` array.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Parse an OpenAI-compatible streaming response and emit `StreamEvent`s.
///
/// Tool call argument fragments arrive interleaved across chunks, each
/// tagged with the `index` of the call they belong to — this accumulates
/// per index and flushes all pending calls, in index order, once a
/// terminal `finish_reason` is observed.
pub async fn process_openai_stream(
    resp: reqwest::Response,
    requested_model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    use futures_util::StreamExt;

    let mut model = requested_model;
    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
    let mut flushed = false;
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let data = match parse_sse_line(line) {
                Some(SseParsed::Data(data)) => data,
                _ => continue,
            };

            if data == "[DONE]" {
                continue;
            }

            let chunk: ChatCompletionChunk = match serde_json::from_str(&data) {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "skipping malformed OpenAI stream chunk");
                    continue;
                }
            };

            if let Some(m) = chunk.model {
                model = m;
            }
            if let Some(usage) = chunk.usage {
                tokens_in = usage.prompt_tokens;
                tokens_out = usage.completion_tokens;
            }

            for choice in chunk.choices {
                if let Some(text) = choice.delta.content {
                    if !text.is_empty() {
                        if tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                            return;
                        }
                    }
                }

                for call_delta in choice.delta.tool_calls.unwrap_or_default() {
                    let slot = pending.entry(call_delta.index).or_default();
                    if let Some(id) = call_delta.id {
                        slot.id = id;
                    }
                    if let Some(function) = call_delta.function {
                        if let Some(name) = function.name {
                            slot.name = name;
                        }
                        if let Some(args) = function.arguments {
                            slot.arguments.push_str(&args);
                        }
                    }
                }

                if let Some(reason) = choice.finish_reason {
                    stop_reason = normalize_finish_reason(&reason);
                    if matches!(reason.as_str(), "tool_calls" | "stop") && !flushed {
                        flushed = true;
                        if flush_tool_calls(&mut pending, &tx).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    if !flushed {
        if flush_tool_calls(&mut pending, &tx).await.is_err() {
            return;
        }
    }

    let _ = tx
        .send(StreamEvent::Done { model, tokens_in, tokens_out, stop_reason })
        .await;
}

fn normalize_finish_reason(reason: &str) -> String {
    if reason == "tool_calls" {
        "tool_use".to_string()
    } else {
        reason.to_string()
    }
}

async fn flush_tool_calls(
    pending: &mut BTreeMap<u32, PendingToolCall>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), ()> {
    for (_, call) in std::mem::take(pending) {
        if call.name.is_empty() {
            continue;
        }
        // Same tie-break as the Anthropic dialect: an unparseable or empty
        // argument fragment yields `{}` rather than dropping the call.
        let input = serde_json::from_str::<serde_json::Value>(&call.arguments)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let event = StreamEvent::ToolUse { id: call.id, name: call.name, input };
        if tx.send(event).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    model: Option<String>,
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interleaved_tool_call_deltas_flush_in_index_order() {
        let (tx, mut rx) = mpsc::channel(32);
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();

        // Index 0's arguments arrive split across 5 fragments, index 1's
        // across 3, interleaved in delivery order.
        let deltas: Vec<(u32, Option<&str>, &str)> = vec![
            (0, Some("get_weather"), "{\"ci"),
            (1, Some("get_time"), "{\"zo"),
            (0, None, "ty\":\""),
            (1, None, "ne\":\""),
            (0, None, "Bos"),
            (1, None, "UTC"),
            (0, None, "ton\""),
            (0, None, "}"),
            (1, None, "\"}"),
        ];

        for (index, name, frag) in deltas {
            let slot = pending.entry(index).or_default();
            slot.id = format!("call_{index}");
            if let Some(n) = name {
                slot.name = n.to_string();
            }
            slot.arguments.push_str(frag);
        }

        flush_tool_calls(&mut pending, &tx).await.unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }

        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::ToolUse { name, input, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(input, &serde_json::json!({"city": "Boston"}));
            }
            _ => panic!("expected ToolUse"),
        }
        match &events[1] {
            StreamEvent::ToolUse { name, input, .. } => {
                assert_eq!(name, "get_time");
                assert_eq!(input, &serde_json::json!({"zone": "UTC"}));
            }
            _ => panic!("expected ToolUse"),
        }
    }

    #[test]
    fn finish_reason_tool_calls_normalizes_to_tool_use() {
        assert_eq!(normalize_finish_reason("tool_calls"), "tool_use");
        assert_eq!(normalize_finish_reason("stop"), "stop");
    }
}
