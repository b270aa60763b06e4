//! File-backed credential store. Lives in the gateway binary, not
//! `vesper-core` — it must stay process-local and is never written by the
//! core into any persisted artifact, so the core only ever sees the trait,
//! never this concrete backing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use vesper_core::collaborators::CredentialStore;
use vesper_core::persist::{atomic_write_json, read_json};

pub struct FileCredentialStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl FileCredentialStore {
    pub fn load(path: PathBuf) -> Self {
        let values = read_json::<BTreeMap<String, String>>(&path).ok().flatten().unwrap_or_default();
        Self { path, values: RwLock::new(values) }
    }

    fn persist(&self, snapshot: &BTreeMap<String, String>) {
        if let Err(e) = atomic_write_json(&self.path, snapshot) {
            tracing::warn!(error = %e, "failed to persist credential store");
        }
    }

    /// Names only, never values — for the `/api/creds` panel listing.
    pub fn names(&self) -> Vec<String> {
        self.values.read().unwrap().keys().cloned().collect()
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().unwrap().get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) {
        let mut values = self.values.write().unwrap();
        values.insert(name.to_string(), value.to_string());
        self.persist(&values);
    }

    fn remove(&self, name: &str) {
        let mut values = self.values.write().unwrap();
        values.remove(name);
        self.persist(&values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let store = FileCredentialStore::load(path.clone());
        store.set("anthropic_api_key", "sk-test");

        let reloaded = FileCredentialStore::load(path);
        assert_eq!(reloaded.get("anthropic_api_key"), Some("sk-test".to_string()));
    }

    #[test]
    fn remove_clears_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::load(dir.path().join("creds.json"));
        store.set("k", "v");
        store.remove("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn names_never_exposes_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::load(dir.path().join("creds.json"));
        store.set("anthropic_api_key", "sk-secret");
        assert_eq!(store.names(), vec!["anthropic_api_key".to_string()]);
    }
}
