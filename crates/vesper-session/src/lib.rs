pub mod compact;
pub mod engine;
pub mod error;
pub mod identity;
pub mod types;

pub use engine::{SessionEngine, TurnEvent, TurnOutcome};
pub use error::{Result, SessionError};
pub use identity::{IdentityComposer, PromptInputs};
pub use types::{
    CostSummary, Message, Outfit, PlanTask, Session, SessionLimits, SessionMetadata, TaskPlan,
    TaskStatus, ToolCallRecord, ToolResultPair,
};
