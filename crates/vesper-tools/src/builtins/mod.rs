pub mod list_files;
pub mod read_file;
pub mod search_files;
pub mod write_file;

use std::sync::Arc;

use crate::tool::Tool;

/// The fixed set of tools that always ship with the daemon. Custom tools
/// may never shadow any of these names (see `ToolRegistry::load_custom`).
pub fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(read_file::ReadFileTool),
        Arc::new(write_file::WriteFileTool),
        Arc::new(list_files::ListFilesTool),
        Arc::new(search_files::SearchFilesTool),
    ]
}
