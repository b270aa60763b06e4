//! Narrow trait seams for the external collaborators named in the external
//! interfaces contract but out of core scope (credential vault, journal,
//! vault search, memory recall, graph extraction, notifier). The core is
//! built and tested against `NullCollaborators`, which is a quiet no-op;
//! a real deployment wires in concrete adapters without touching the core.

use async_trait::async_trait;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: &str);
    fn remove(&self, name: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalSection {
    Notes,
    Tasks,
    Decisions,
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn ensure_today(&self) -> std::io::Result<()>;
    async fn append_entry(&self, text: &str, section: JournalSection) -> std::io::Result<()>;
    async fn read_today(&self) -> std::io::Result<String>;
    /// Idempotent: applying this to an already-checked-off line is a no-op.
    async fn check_off_task(&self, original_line: &str) -> std::io::Result<()>;
}

#[async_trait]
pub trait VaultSearch: Send + Sync {
    async fn find_recent(&self, dir: &str, minutes: u64) -> Vec<String>;
    async fn search(&self, query: &str, max_results: usize) -> Vec<String>;
}

#[async_trait]
pub trait MemoryRecall: Send + Sync {
    /// Must swallow its own failures; callers treat `None` as "nothing found".
    async fn recall(&self, user_turn: &str) -> Option<String>;
}

#[async_trait]
pub trait GraphExtractor: Send + Sync {
    /// Fire-and-forget: must never block or propagate errors to the caller.
    async fn extract(&self, session_id: &str, summary: &str, metadata: serde_json::Value);
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, text: &str, channel: Option<&str>);
}

/// A swallow-everything implementation used where no concrete collaborator
/// is configured. Every method degrades to "nothing happened" rather than
/// erroring, matching the core's rule that collaborator failures never
/// abort the primary chat loop.
pub struct NullCollaborators;

#[async_trait]
impl Journal for NullCollaborators {
    async fn ensure_today(&self) -> std::io::Result<()> {
        Ok(())
    }
    async fn append_entry(&self, _text: &str, _section: JournalSection) -> std::io::Result<()> {
        Ok(())
    }
    async fn read_today(&self) -> std::io::Result<String> {
        Ok(String::new())
    }
    async fn check_off_task(&self, _original_line: &str) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VaultSearch for NullCollaborators {
    async fn find_recent(&self, _dir: &str, _minutes: u64) -> Vec<String> {
        Vec::new()
    }
    async fn search(&self, _query: &str, _max_results: usize) -> Vec<String> {
        Vec::new()
    }
}

#[async_trait]
impl MemoryRecall for NullCollaborators {
    async fn recall(&self, _user_turn: &str) -> Option<String> {
        None
    }
}

#[async_trait]
impl GraphExtractor for NullCollaborators {
    async fn extract(&self, _session_id: &str, _summary: &str, _metadata: serde_json::Value) {}
}

#[async_trait]
impl Notifier for NullCollaborators {
    async fn notify_user(&self, _text: &str, _channel: Option<&str>) {}
}
