//! One-time, idempotent data directory setup. There is no schema to
//! version yet — this just ensures every directory in the persisted state
//! layout exists before anything tries to read or write into it.

use std::path::Path;

pub fn migrate_data_dir(data_dir: &Path) -> std::io::Result<()> {
    for sub in ["sessions", "custom-tools", "custom-tools-quarantine", "graph", "identity", "contexts", "skills"] {
        std::fs::create_dir_all(data_dir.join(sub))?;
    }
    Ok(())
}
