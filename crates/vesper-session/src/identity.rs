//! Identity composer — deterministically assembles the system prompt from
//! always-loaded fragments plus situational, contextual, and recalled
//! inputs. Independent inputs are fetched in parallel; a transient failure
//! degrades its block (omitted) rather than failing the whole build, the
//! same swallow-and-omit posture `NullCollaborators` models throughout
//! `vesper_core::collaborators`.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use vesper_core::collaborators::{Journal, JournalSection, MemoryRecall, VaultSearch};
use vesper_provider::provider::SystemPromptTiers;

use crate::types::{Outfit, SessionLimits, TaskPlan};

/// Per-turn volatile inputs the composer needs beyond its own collaborators.
pub struct PromptInputs<'a> {
    pub default_role_model: &'a str,
    pub today_spend_usd: f64,
    pub loaded_contexts: &'a [String],
    pub outfit: Option<&'a Outfit>,
    pub task_plan: Option<&'a TaskPlan>,
    pub limits: &'a SessionLimits,
    pub elapsed_ms: u64,
    pub spent_usd: f64,
    pub tool_names: &'a [String],
    pub custom_tool_names: &'a [String],
    pub user_turn: &'a str,
}

pub struct IdentityComposer {
    journal: Arc<dyn Journal>,
    vault: Arc<dyn VaultSearch>,
    memory: Arc<dyn MemoryRecall>,
    identity_fragments: Vec<String>,
    personality: String,
    rules_block: String,
    contexts_dir: Option<PathBuf>,
    skills_dir: Option<PathBuf>,
}

impl IdentityComposer {
    pub fn new(
        journal: Arc<dyn Journal>,
        vault: Arc<dyn VaultSearch>,
        memory: Arc<dyn MemoryRecall>,
        identity_fragments: Vec<String>,
        personality: String,
        rules_block: String,
        contexts_dir: Option<PathBuf>,
        skills_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            journal,
            vault,
            memory,
            identity_fragments,
            personality,
            rules_block,
            contexts_dir,
            skills_dir,
        }
    }

    fn read_context(&self, name: &str) -> Option<String> {
        let dir = self.contexts_dir.as_ref()?;
        std::fs::read_to_string(dir.join(format!("{name}.md"))).ok()
    }

    fn available_contexts_index(&self) -> String {
        let Some(dir) = &self.contexts_dir else {
            return String::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return String::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        if names.is_empty() {
            return String::new();
        }
        format!("## Available contexts\n{}\n", names.join(", "))
    }

    fn skills_index(&self) -> String {
        let Some(dir) = &self.skills_dir else {
            return String::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return String::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        if names.is_empty() {
            return String::new();
        }
        format!("## Skills\n{}\n", names.join(", "))
    }

    /// Build the three cache tiers. `static_tier` and `user_tier` rarely
    /// change across turns, so an A-dialect provider can cache-breakpoint
    /// them; `volatile_tier` always changes and is never cached.
    pub async fn compose(&self, inputs: PromptInputs<'_>) -> SystemPromptTiers {
        let _ = self.journal.ensure_today().await;

        let (journal_today, recall) = tokio::join!(
            async { self.journal.read_today().await.unwrap_or_default() },
            async { self.memory.recall(inputs.user_turn).await },
        );

        let static_tier = [self.identity_fragments.join("\n\n"), self.personality.clone()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let custom_tools_index = if inputs.custom_tool_names.is_empty() {
            String::new()
        } else {
            format!("## Custom tools\n{}\n", inputs.custom_tool_names.join(", "))
        };

        let capabilities_summary = format!(
            "## Capabilities\n{} tools available: {}\n",
            inputs.tool_names.len(),
            inputs.tool_names.join(", ")
        );

        let user_tier = [
            self.available_contexts_index(),
            self.skills_index(),
            custom_tools_index,
            capabilities_summary,
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

        let now = chrono::Local::now();
        let situational = format!(
            "## Situational awareness\nLocal time: {}\nModel (default role): {}\nToday's spend: ${:.4}\n",
            now.format("%Y-%m-%d %H:%M %Z"),
            inputs.default_role_model,
            inputs.today_spend_usd,
        );

        let journal_block = if journal_today.is_empty() {
            String::new()
        } else {
            format!("## Today's journal\n{journal_today}\n")
        };

        let mut contexts_block = String::new();
        for name in inputs.loaded_contexts {
            if let Some(content) = self.read_context(name) {
                contexts_block.push_str(&format!("## Context: {name}\n{content}\n"));
            } else {
                debug!(context = name, "context content unavailable, omitting");
            }
        }

        let outfit_block = inputs
            .outfit
            .map(|o| format!("## Active outfit: {}\n{}\n", o.name, o.content))
            .unwrap_or_default();

        let plan_block = inputs.task_plan.map(|p| p.render_checklist()).unwrap_or_default();

        let mut budget_block = String::new();
        if let Some(ceiling) = inputs.limits.cost_ceiling_usd {
            budget_block.push_str(&format!(
                "Budget remaining: ${:.4} of ${:.4}\n",
                (ceiling - inputs.spent_usd).max(0.0),
                ceiling
            ));
        }
        if let Some(deadline_ms) = inputs.limits.deadline_ms {
            let remaining = deadline_ms.saturating_sub(inputs.elapsed_ms);
            budget_block.push_str(&format!("Time remaining: {remaining}ms\n"));
        }

        let recall_block = match recall {
            Some(snippet) if !snippet.is_empty() => {
                format!("---\n## Recalled from Memory\n{snippet}\n")
            }
            _ => String::new(),
        };

        let volatile_tier = [
            situational,
            journal_block,
            contexts_block,
            outfit_block,
            plan_block,
            budget_block,
            recall_block,
            self.rules_block.clone(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

        SystemPromptTiers { static_tier, user_tier, volatile_tier }
    }

    /// Thin wrapper kept for tools that need to search recent vault activity
    /// directly (used by the `search_files`-adjacent built-ins); not part of
    /// the prompt composition path itself.
    pub async fn find_recent(&self, dir: &str, minutes: u64) -> Vec<String> {
        self.vault.find_recent(dir, minutes).await
    }

    pub async fn append_journal_note(&self, text: &str) {
        let _ = self.journal.append_entry(text, JournalSection::Notes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubJournal(String);
    #[async_trait]
    impl Journal for StubJournal {
        async fn ensure_today(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn append_entry(&self, _text: &str, _section: JournalSection) -> std::io::Result<()> {
            Ok(())
        }
        async fn read_today(&self) -> std::io::Result<String> {
            Ok(self.0.clone())
        }
        async fn check_off_task(&self, _original_line: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct StubVault;
    #[async_trait]
    impl VaultSearch for StubVault {
        async fn find_recent(&self, _dir: &str, _minutes: u64) -> Vec<String> {
            Vec::new()
        }
        async fn search(&self, _query: &str, _max_results: usize) -> Vec<String> {
            Vec::new()
        }
    }

    struct StubMemory(Option<String>);
    #[async_trait]
    impl MemoryRecall for StubMemory {
        async fn recall(&self, _user_turn: &str) -> Option<String> {
            self.0.clone()
        }
    }

    fn composer(journal_text: &str, recall: Option<&str>) -> IdentityComposer {
        IdentityComposer::new(
            Arc::new(StubJournal(journal_text.to_string())),
            Arc::new(StubVault),
            Arc::new(StubMemory(recall.map(|s| s.to_string()))),
            vec!["I am Vesper.".into()],
            "Personality: terse, direct.".into(),
            "## Rules\nAlways confirm destructive actions.".into(),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn compose_includes_recall_block_when_present() {
        let composer = composer("", Some("the user prefers dark roast coffee"));
        let tiers = composer
            .compose(PromptInputs {
                default_role_model: "claude-sonnet-4-5",
                today_spend_usd: 0.12,
                loaded_contexts: &[],
                outfit: None,
                task_plan: None,
                limits: &SessionLimits::default(),
                elapsed_ms: 0,
                spent_usd: 0.0,
                tool_names: &["read_file".to_string()],
                custom_tool_names: &[],
                user_turn: "what do I drink in the morning?",
            })
            .await;
        assert!(tiers.volatile_tier.contains("Recalled from Memory"));
        assert!(tiers.volatile_tier.contains("dark roast"));
    }

    #[tokio::test]
    async fn compose_omits_recall_block_when_absent() {
        let composer = composer("", None);
        let tiers = composer
            .compose(PromptInputs {
                default_role_model: "claude-sonnet-4-5",
                today_spend_usd: 0.0,
                loaded_contexts: &[],
                outfit: None,
                task_plan: None,
                limits: &SessionLimits::default(),
                elapsed_ms: 0,
                spent_usd: 0.0,
                tool_names: &[],
                custom_tool_names: &[],
                user_turn: "hi",
            })
            .await;
        assert!(!tiers.volatile_tier.contains("Recalled from Memory"));
    }

    #[tokio::test]
    async fn compose_includes_budget_block_when_limits_set() {
        let composer = composer("", None);
        let limits = SessionLimits { max_tool_rounds: 50, cost_ceiling_usd: Some(1.0), deadline_ms: Some(60_000) };
        let tiers = composer
            .compose(PromptInputs {
                default_role_model: "claude-sonnet-4-5",
                today_spend_usd: 0.0,
                loaded_contexts: &[],
                outfit: None,
                task_plan: None,
                limits: &limits,
                elapsed_ms: 10_000,
                spent_usd: 0.25,
                tool_names: &[],
                custom_tool_names: &[],
                user_turn: "hi",
            })
            .await;
        assert!(tiers.volatile_tier.contains("Budget remaining"));
        assert!(tiers.volatile_tier.contains("Time remaining"));
    }
}
