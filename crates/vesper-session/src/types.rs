//! The durable session data model. A session is mutated only by the
//! session engine under a logical per-session mutex and persisted on every
//! turn and every compaction.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use vesper_core::types::{Role, VesperId};

/// One tool-call record on an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One tool-result pair, used by the A-dialect's single-user-turn packing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPair {
    pub tool_call_id: String,
    pub content: String,
}

/// A dialect-neutral chat turn. `SystemInjection` is intentionally absent —
/// the system prompt is computed fresh on every turn and never persisted
/// into `messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    UserText { text: String },
    UserToolResults { pairs: Vec<ToolResultPair> },
    AssistantText { text: String },
    AssistantWithToolCalls { text: Option<String>, calls: Vec<ToolCallRecord> },
}

impl Message {
    /// Tool-call IDs referenced by a tool-result-carrying turn, if any.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match self {
            Message::UserToolResults { pairs } => {
                pairs.iter().map(|p| p.tool_call_id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Tool-call IDs issued by an assistant turn, if any.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            Message::AssistantWithToolCalls { calls, .. } => {
                calls.iter().map(|c| c.id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// True for a real user question — a plain text turn, not a tool-result
    /// carrier. Used by the compaction safe-split search.
    pub fn is_real_user_turn(&self) -> bool {
        matches!(self, Message::UserText { .. })
    }

    pub fn is_user_turn(&self) -> bool {
        matches!(self, Message::UserText { .. } | Message::UserToolResults { .. })
    }

    /// Canonical A-dialect content-block JSON for this turn. Dialect-specific
    /// wire adaptation (to O-dialect `tool_calls`/`role:"tool"` turns) happens
    /// entirely inside `vesper_provider`, keeping this type dialect-neutral.
    pub fn to_raw_json(&self) -> serde_json::Value {
        match self {
            Message::UserText { text } => serde_json::json!({"role": "user", "content": text}),
            Message::UserToolResults { pairs } => {
                let blocks: Vec<serde_json::Value> = pairs
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "type": "tool_result",
                            "tool_use_id": p.tool_call_id,
                            "content": p.content,
                        })
                    })
                    .collect();
                serde_json::json!({"role": "user", "content": blocks})
            }
            Message::AssistantText { text } => {
                serde_json::json!({"role": "assistant", "content": text})
            }
            Message::AssistantWithToolCalls { text, calls } => {
                let mut blocks: Vec<serde_json::Value> = Vec::new();
                if let Some(t) = text {
                    if !t.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": t}));
                    }
                }
                for call in calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                serde_json::json!({"role": "assistant", "content": blocks})
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub text: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal: String,
    pub tasks: Vec<PlanTask>,
}

impl TaskPlan {
    /// Render as a markdown checklist for the system prompt.
    pub fn render_checklist(&self) -> String {
        let mut out = format!("## Active task plan: {}\n", self.goal);
        for task in &self.tasks {
            let mark = match task.status {
                TaskStatus::Pending => " ",
                TaskStatus::InProgress => "~",
                TaskStatus::Done => "x",
                TaskStatus::Failed => "!",
                TaskStatus::Skipped => "-",
            };
            out.push_str(&format!("- [{}] {}\n", mark, task.text));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outfit {
    pub name: String,
    pub content: String,
    pub tools: Option<HashSet<String>>,
    pub contexts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub call_count: u64,
}

impl Default for CostSummary {
    fn default() -> Self {
        Self { total_usd: 0.0, input_tokens: 0, output_tokens: 0, call_count: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub created_at: String,
    pub updated_at: String,
    pub cost: CostSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    pub max_tool_rounds: usize,
    pub cost_ceiling_usd: Option<f64>,
    pub deadline_ms: Option<u64>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { max_tool_rounds: 50, cost_ceiling_usd: None, deadline_ms: None }
    }
}

impl SessionLimits {
    pub fn sub_agent() -> Self {
        Self { max_tool_rounds: 20, ..Default::default() }
    }

    pub fn long_running() -> Self {
        Self { max_tool_rounds: 200, ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub contexts: Vec<String>,
    pub role: Role,
    pub metadata: SessionMetadata,
    pub task_plan: Option<TaskPlan>,
    pub outfit: Option<Outfit>,
    pub limits: SessionLimits,
    /// Monotonic wall-clock deadline, set at session construction when
    /// `limits.deadline_ms` is present. Not serialized — recomputed from
    /// `limits.deadline_ms` relative to the turn's start on each `send`.
    #[serde(skip)]
    pub started_at: Option<std::time::Instant>,
}

impl Session {
    pub fn new(role: Role) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: VesperId::new().to_string(),
            messages: Vec::new(),
            contexts: Vec::new(),
            role,
            metadata: SessionMetadata {
                created_at: now.clone(),
                updated_at: now,
                cost: CostSummary::default(),
            },
            task_plan: None,
            outfit: None,
            limits: SessionLimits::default(),
            started_at: Some(std::time::Instant::now()),
        }
    }

    pub fn touch(&mut self) {
        self.metadata.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Record usage from one provider call. `cost_usd` is the marginal cost
    /// of this call; `metadata.cost.total_usd` is monotonically
    /// non-decreasing across the session's lifetime.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.metadata.cost.input_tokens += input_tokens;
        self.metadata.cost.output_tokens += output_tokens;
        self.metadata.cost.total_usd += cost_usd;
        self.metadata.cost.call_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_round_trip_to_raw_json() {
        let msg = Message::AssistantWithToolCalls {
            text: Some("checking".into()),
            calls: vec![ToolCallRecord {
                id: "toolu_1".into(),
                name: "get_weather".into(),
                arguments: serde_json::json!({"city": "Boston"}),
            }],
        };
        let raw = msg.to_raw_json();
        assert_eq!(raw["role"], "assistant");
        let content = raw["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[1]["type"], "tool_use");
    }

    #[test]
    fn usage_accumulates_monotonically() {
        let mut session = Session::new(Role::Default);
        session.record_usage(10, 20, 0.01);
        session.record_usage(5, 5, 0.005);
        assert_eq!(session.metadata.cost.call_count, 2);
        assert!((session.metadata.cost.total_usd - 0.015).abs() < 1e-9);
    }
}
