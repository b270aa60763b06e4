//! Heartbeat data model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Inbox,
    Task,
    Github,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Main,
    Act,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ignored,
    Alerted,
    Acted,
    Escalated,
    ActCrashed,
    EscalationFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ignored => "ignored",
            Outcome::Alerted => "alerted",
            Outcome::Acted => "acted",
            Outcome::Escalated => "escalated",
            Outcome::ActCrashed => "act_crashed",
            Outcome::EscalationFailed => "escalation_failed",
        }
    }
}

/// A prior tick's recorded outcome for an event matching the same
/// normalized summary, surfaced to the triage prompt as `_prior`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorOutcome {
    pub date: String,
    pub outcome: Outcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub summary: String,
    pub route: Option<Route>,
    pub original_text: Option<String>,
    pub prior_outcome: Option<PriorOutcome>,
}

impl HeartbeatEvent {
    pub fn new(event_type: EventType, summary: impl Into<String>) -> Self {
        Self { event_type, summary: summary.into(), route: None, original_text: None, prior_outcome: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandledEvent {
    pub date: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub last_attempt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub last_run: Option<String>,
    pub last_inbox_check: Option<String>,
    /// Capped at the most recent 200 notification IDs.
    pub seen_github: Vec<String>,
    /// Keyed by the hex digest of the event's normalized summary.
    pub handled_events: HashMap<String, HandledEvent>,
    pub last_user_contact: Option<String>,
}

impl HeartbeatState {
    pub const SEEN_GITHUB_CAP: usize = 200;

    pub fn remember_github(&mut self, id: String) {
        if self.seen_github.contains(&id) {
            return;
        }
        self.seen_github.push(id);
        if self.seen_github.len() > Self::SEEN_GITHUB_CAP {
            let overflow = self.seen_github.len() - Self::SEEN_GITHUB_CAP;
            self.seen_github.drain(0..overflow);
        }
    }

    /// Drop `handled_events` entries that aren't from today.
    pub fn prune_handled_events(&mut self, today: &str) {
        self.handled_events.retain(|_, h| h.date == today);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallAudit {
    pub tool: String,
    pub args: serde_json::Value,
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub tier: String,
    pub model: String,
    pub events: Vec<String>,
    pub tool_calls: Vec<ToolCallAudit>,
    pub response: String,
    pub tool_errors: bool,
}

/// Truncate to at most `max` chars, as the audit log and prior-outcome
/// summaries require (tool results and responses are capped at 500 chars).
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
