//! Atomic JSON persistence — write-to-temp-file then rename, so a crash
//! mid-write never corrupts the on-disk artifact. Every persisted state
//! file in the daemon (sessions, cost ledger, cron store, heartbeat
//! state/audit, channel conversation maps) goes through this helper.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, VesperError};

/// Serialize `value` as pretty JSON and write it to `path` atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let tmp_path = tmp_path_for(path);
    std::fs::write(&tmp_path, &body).map_err(|e| {
        VesperError::Persistence(format!("failed to write temp file '{}': {}", tmp_path.display(), e))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        VesperError::Persistence(format!("failed to rename temp file to '{}': {}", path.display(), e))
    })?;
    Ok(())
}

/// Read and parse a JSON file. Returns `Ok(None)` if the file does not exist
/// so callers can distinguish "never written" from a parse failure.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VesperError::Io(e)),
    }
}

/// Append a single JSON-serialized line to a `.jsonl` archive file, creating
/// it if necessary. Used for session compaction archives.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use std::io::Write;
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| VesperError::Persistence(format!("failed to open '{}': {}", path.display(), e)))?;
    file.write_all(line.as_bytes())
        .map_err(|e| VesperError::Persistence(format!("failed to append to '{}': {}", path.display(), e)))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".vesper_tmp");
    std::path::PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");

        atomic_write_json(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        let read: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(read, Sample { a: 1, b: "x".into() });

        atomic_write_json(&path, &Sample { a: 2, b: "y".into() }).unwrap();
        let read: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(read, Sample { a: 2, b: "y".into() });

        // no leftover temp file
        assert!(!dir.path().join("sample.json.vesper_tmp").exists());
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let read: Option<Sample> = read_json(&path).unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        append_jsonl(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        append_jsonl(&path, &Sample { a: 2, b: "y".into() }).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
