//! The persisted conversation→session map (`<channel>-sessions.json`).
//! Writes are serialized through the poller loop (the map is only ever
//! mutated from `ChannelPoller::handle_message`, which already processes
//! one conversation's messages at a time); reads are served from the
//! in-memory `DashMap` for the lifetime of the process, so a live process
//! never needs to fall back to disk between writes.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use vesper_core::persist::{atomic_write_json, read_json};
use vesper_core::types::Role;
use vesper_session::SessionEngine;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    session_id: String,
    prompt_built_at: String,
}

pub struct ConversationMap {
    path: PathBuf,
    entries: DashMap<String, Entry>,
}

impl ConversationMap {
    pub fn load(path: PathBuf) -> Result<Self> {
        let loaded: std::collections::HashMap<String, Entry> = read_json(&path)?.unwrap_or_default();
        let entries = DashMap::new();
        for (k, v) in loaded {
            entries.insert(k, v);
        }
        Ok(Self { path, entries })
    }

    fn persist(&self) -> Result<()> {
        let snapshot: std::collections::HashMap<String, Entry> =
            self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        atomic_write_json(&self.path, &snapshot)?;
        Ok(())
    }

    /// Resolve `conversation_id` to a session, creating and persisting a
    /// fresh mapping on first contact.
    pub fn resolve_or_create(&self, conversation_id: &str, engine: &Arc<SessionEngine>, role: Role) -> Result<String> {
        if let Some(entry) = self.entries.get(conversation_id) {
            return Ok(entry.session_id.clone());
        }
        let session_id = engine.create_session(role, None);
        self.entries.insert(
            conversation_id.to_string(),
            Entry { session_id: session_id.clone(), prompt_built_at: Utc::now().to_rfc3339() },
        );
        self.persist()?;
        Ok(session_id)
    }

    /// True once more than 5 minutes have passed since the system prompt
    /// was last (re)built for this conversation. The session
    /// engine itself recomputes the system prompt fresh on every turn
    /// (there is nothing cached to actually go stale inside a turn), so
    /// this only gates whether the poller bumps `prompt_built_at` — a
    /// placeholder for a future engine that does cache prompt compilation.
    pub fn is_prompt_stale(&self, conversation_id: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(conversation_id) {
            Some(entry) => match DateTime::parse_from_rfc3339(&entry.prompt_built_at) {
                Ok(built) => now.signed_duration_since(built) > chrono::Duration::minutes(5),
                Err(_) => true,
            },
            None => true,
        }
    }

    pub fn note_prompt_rebuilt(&self, conversation_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(conversation_id) {
            entry.prompt_built_at = Utc::now().to_rfc3339();
        }
    }

    /// Invalidate a conversation's mapping, forcing a fresh session on the
    /// next message (`/new`, `/clear`).
    pub fn invalidate(&self, conversation_id: &str) -> Result<()> {
        self.entries.remove(conversation_id);
        self.persist()
    }
}
