pub mod error;
pub mod pipeline;
pub mod sources;
pub mod types;

pub use error::{HeartbeatError, Result};
pub use pipeline::HeartbeatPipeline;
pub use sources::{scan_github, scan_inbox, scan_tasks, synthesize_idle_event, GithubSource, NullGithubSource, ShellGithubSource};
pub use types::{AuditEntry, EventType, HandledEvent, HeartbeatEvent, HeartbeatState, Outcome, PriorOutcome, Route, ToolCallAudit};
