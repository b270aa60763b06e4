pub mod builtins;
pub mod registry;
pub mod schema;
pub mod tool;

pub use registry::{QuarantineEntry, ToolRegistry};
pub use tool::{Tool, ToolCtx, ToolResult};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("schema validation failed: {0}")]
    InvalidSchema(String),

    #[error("duplicate tool name: {0}")]
    Duplicate(String),

    #[error("tool shadows a built-in: {0}")]
    ShadowsBuiltin(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
