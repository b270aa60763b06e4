//! Name-addressed tool registry. Built-ins are always present;
//! user-supplied (custom) tools live in their own namespace and are
//! subject to two load-time rules: a custom tool may never shadow a
//! built-in name, and among custom tools, first-loaded wins — both
//! violations are quarantined rather than rejected outright, so a bad
//! custom tool never prevents the daemon from starting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;
use vesper_provider::provider::ToolDefinition;

use crate::builtins;
use crate::schema;
use crate::tool::Tool;

/// One quarantined load attempt, recorded for the `/api/custom-tools` panel
/// endpoint.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub name: String,
    pub source_path: Option<PathBuf>,
    pub reason: String,
}

pub struct ToolRegistry {
    builtins: BTreeMap<String, Arc<dyn Tool>>,
    custom: BTreeMap<String, Arc<dyn Tool>>,
    quarantined: Vec<QuarantineEntry>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut builtins = BTreeMap::new();
        for tool in builtins::all() {
            builtins.insert(tool.name().to_string(), tool);
        }
        Self { builtins, custom: BTreeMap::new(), quarantined: Vec::new() }
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    /// Attempt to register a custom tool loaded from `source_path`. `attempt`
    /// carries either the successfully constructed tool or the load-time
    /// exception message (schema parse failure, module load error, etc.) —
    /// both paths funnel into the same quarantine logic so one bad custom
    /// tool can never abort startup.
    pub fn load_custom(
        &mut self,
        source_path: &Path,
        attempt: Result<Arc<dyn Tool>, String>,
        quarantine_dir: &Path,
    ) {
        let tool = match attempt {
            Ok(tool) => tool,
            Err(reason) => {
                self.quarantine(source_path, "<unknown>", &reason, quarantine_dir);
                return;
            }
        };

        let name = tool.name().to_string();

        if self.builtins.contains_key(&name) {
            self.quarantine(
                source_path,
                &name,
                &format!("custom tool `{name}` shadows a built-in tool of the same name"),
                quarantine_dir,
            );
            return;
        }

        if self.custom.contains_key(&name) {
            self.quarantine(
                source_path,
                &name,
                &format!("duplicate custom tool name `{name}`; first-loaded wins"),
                quarantine_dir,
            );
            return;
        }

        if let Err(e) = schema::validate(&tool.input_schema()) {
            self.quarantine(
                source_path,
                &name,
                &format!("schema validation failed for `{name}`: {e}"),
                quarantine_dir,
            );
            return;
        }

        self.custom.insert(name, tool);
    }

    fn quarantine(&mut self, source_path: &Path, name: &str, reason: &str, quarantine_dir: &Path) {
        warn!(name, reason, "quarantining custom tool");
        if let Err(e) = move_to_quarantine(source_path, quarantine_dir, reason) {
            warn!(error = %e, "failed to move quarantined tool file; continuing anyway");
        }
        self.quarantined.push(QuarantineEntry {
            name: name.to_string(),
            source_path: Some(source_path.to_path_buf()),
            reason: reason.to_string(),
        });
    }

    pub fn quarantined(&self) -> &[QuarantineEntry] {
        &self.quarantined
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.custom.get(name).or_else(|| self.builtins.get(name)).cloned()
    }

    pub fn all_names(&self) -> Vec<String> {
        self.builtins.keys().chain(self.custom.keys()).cloned().collect()
    }

    pub fn custom_names(&self) -> Vec<String> {
        self.custom.keys().cloned().collect()
    }

    /// Dialect-neutral tool definitions for every registered tool, optionally
    /// narrowed to an outfit's allow-list (the session advertises only the
    /// intersection of registered tools and the outfit's named set).
    pub fn definitions(&self, allow: Option<&std::collections::HashSet<String>>) -> Vec<ToolDefinition> {
        self.builtins
            .values()
            .chain(self.custom.values())
            .filter(|t| allow.map(|set| set.contains(t.name())).unwrap_or(true))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }
}

/// Move a quarantined custom tool's source file into `quarantine_dir` and
/// write a `.reason` sidecar file next to it describing why.
fn move_to_quarantine(source_path: &Path, quarantine_dir: &Path, reason: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(quarantine_dir)?;
    let file_name = source_path
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| std::ffi::OsString::from("unknown"));
    let dest = quarantine_dir.join(&file_name);
    if source_path.exists() {
        std::fs::rename(source_path, &dest)?;
    }
    let reason_path = {
        let mut p = dest.clone();
        let mut name = p.file_name().unwrap_or_default().to_os_string();
        name.push(".reason");
        p.set_file_name(name);
        p
    };
    std::fs::write(reason_path, reason)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolCtx, ToolResult};
    use async_trait::async_trait;

    struct EchoTool(&'static str);

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _input: serde_json::Value, _ctx: &dyn ToolCtx) -> ToolResult {
            ToolResult::success("ok")
        }
    }

    struct BadSchemaTool;

    #[async_trait]
    impl Tool for BadSchemaTool {
        fn name(&self) -> &str {
            "bad_schema"
        }
        fn description(&self) -> &str {
            "carries an invalid schema"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"properties": {}})
        }
        async fn execute(&self, _input: serde_json::Value, _ctx: &dyn ToolCtx) -> ToolResult {
            ToolResult::success("ok")
        }
    }

    #[test]
    fn builtins_are_registered_at_construction() {
        let registry = ToolRegistry::new();
        assert!(registry.is_builtin("read_file"));
        assert!(registry.get("read_file").is_some());
    }

    #[test]
    fn custom_tool_shadowing_builtin_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("read_file.tool");
        std::fs::write(&source, "stub").unwrap();
        let quarantine_dir = dir.path().join("quarantine");

        let mut registry = ToolRegistry::new();
        registry.load_custom(&source, Ok(Arc::new(EchoTool("read_file"))), &quarantine_dir);

        assert!(registry.quarantined().iter().any(|q| q.name == "read_file"));
        // Built-in wins; the custom one never overwrites it.
        assert!(registry.get("read_file").is_some());
        assert!(quarantine_dir.join("read_file.tool").exists());
        assert!(quarantine_dir.join("read_file.tool.reason").exists());
    }

    #[test]
    fn duplicate_custom_names_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let quarantine_dir = dir.path().join("quarantine");
        let mut registry = ToolRegistry::new();

        let first = dir.path().join("a.tool");
        std::fs::write(&first, "stub").unwrap();
        registry.load_custom(&first, Ok(Arc::new(EchoTool("my_tool"))), &quarantine_dir);

        let second = dir.path().join("b.tool");
        std::fs::write(&second, "stub").unwrap();
        registry.load_custom(&second, Ok(Arc::new(EchoTool("my_tool"))), &quarantine_dir);

        assert_eq!(registry.quarantined().len(), 1);
        assert!(quarantine_dir.join("b.tool").exists());
    }

    #[test]
    fn invalid_schema_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bad.tool");
        std::fs::write(&source, "stub").unwrap();
        let quarantine_dir = dir.path().join("quarantine");

        let mut registry = ToolRegistry::new();
        registry.load_custom(&source, Ok(Arc::new(BadSchemaTool)), &quarantine_dir);

        assert!(registry.get("bad_schema").is_none());
        assert_eq!(registry.quarantined().len(), 1);
    }

    #[test]
    fn load_exception_is_quarantined_without_crashing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.tool");
        std::fs::write(&source, "stub").unwrap();
        let quarantine_dir = dir.path().join("quarantine");

        let mut registry = ToolRegistry::new();
        registry.load_custom(&source, Err("failed to parse module".to_string()), &quarantine_dir);

        assert_eq!(registry.quarantined().len(), 1);
    }

    #[test]
    fn definitions_respect_outfit_allow_list() {
        let registry = ToolRegistry::new();
        let allow: std::collections::HashSet<String> =
            ["read_file".to_string()].into_iter().collect();
        let defs = registry.definitions(Some(&allow));
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "read_file");
    }
}
