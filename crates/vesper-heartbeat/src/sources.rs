//! Source scanning and idle-event synthesis. The GitHub source follows the
//! same shape as the other out-of-core collaborators in
//! `vesper_core::collaborators`: a narrow trait, a shell-based default
//! implementation, and a `Null` no-op impl for tests.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::types::{EventType, HeartbeatEvent, Route};

/// GitHub notification source, modeled the same way as the other external
/// adapters, with a shell-based default and a `Null` impl for tests.
#[async_trait]
pub trait GithubSource: Send + Sync {
    /// Returns `(notification_id, summary)` pairs, most recent first.
    async fn list_notifications(&self) -> Vec<(String, String)>;
}

pub struct NullGithubSource;

#[async_trait]
impl GithubSource for NullGithubSource {
    async fn list_notifications(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Shells out to the GitHub CLI (`gh`). Non-fatal: any failure to run or
/// parse the command yields an empty list rather than propagating an
/// error into the tick.
pub struct ShellGithubSource;

#[async_trait]
impl GithubSource for ShellGithubSource {
    async fn list_notifications(&self) -> Vec<(String, String)> {
        let output = tokio::process::Command::new("gh")
            .args(["api", "notifications", "--jq", ".[] | .id + \"\\t\" + .subject.title"])
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|line| line.split_once('\t'))
                .map(|(id, title)| (id.to_string(), title.to_string()))
                .collect(),
            Ok(out) => {
                warn!(status = %out.status, "gh api notifications exited non-zero");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "failed to invoke gh CLI");
                Vec::new()
            }
        }
    }
}

/// Inbox events: files modified since `since` (exclusive), sorted by
/// modification time.
pub fn scan_inbox(dir: &Path, since: Option<SystemTime>) -> Vec<HeartbeatEvent> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut found: Vec<(SystemTime, String)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let mtime = meta.modified().ok()?;
            if since.map(|s| mtime > s).unwrap_or(true) {
                Some((mtime, entry.file_name().to_string_lossy().to_string()))
            } else {
                None
            }
        })
        .collect();

    found.sort_by_key(|(t, _)| *t);
    found
        .into_iter()
        .map(|(_, name)| HeartbeatEvent::new(EventType::Inbox, format!("New inbox file: {name}")))
        .collect()
}

/// Task events: `- [ ] …` lines in the journal with `#main`/`#act` routing
/// tags (`#escalate` aliases to `#main`).
pub fn scan_tasks(journal_text: &str) -> Vec<HeartbeatEvent> {
    journal_text
        .lines()
        .filter(|line| line.trim_start().starts_with("- [ ]"))
        .map(|line| {
            let route = if line.contains("#main") || line.contains("#escalate") {
                Some(Route::Main)
            } else if line.contains("#act") {
                Some(Route::Act)
            } else {
                None
            };
            let mut event = HeartbeatEvent::new(EventType::Task, summarize_task_line(line));
            event.route = route;
            event.original_text = Some(line.to_string());
            event
        })
        .collect()
}

fn summarize_task_line(line: &str) -> String {
    let text = line.trim_start().trim_start_matches("- [ ]").trim();
    format!("Open task: {text}")
}

/// GitHub events, deduplicated against `seen` (the 200 most recent IDs —
/// capping happens in `HeartbeatState::remember_github`).
pub fn scan_github(notifications: &[(String, String)], seen: &[String]) -> Vec<HeartbeatEvent> {
    notifications
        .iter()
        .filter(|(id, _)| !seen.contains(id))
        .map(|(_, title)| HeartbeatEvent::new(EventType::Github, format!("GitHub notification: {title}")))
        .collect()
}

/// Synthesizes a single idle-awareness event when no other events fired,
/// the user has been silent for more than two hours, and the local hour is
/// within the daytime window `[9, 21]`.
pub fn synthesize_idle_event(
    last_user_contact: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    journal_snippet: Option<&str>,
    profile_snippet: Option<&str>,
    profile_depth: usize,
) -> Option<HeartbeatEvent> {
    let local_hour = chrono::Local::now().hour();
    if !(9..=21).contains(&local_hour) {
        return None;
    }
    let silent_for = match last_user_contact {
        Some(last) => now - last,
        None => return None,
    };
    if silent_for < chrono::Duration::hours(2) {
        return None;
    }

    let mut summary = String::from("User has been quiet for a while.");
    if let Some(j) = journal_snippet.filter(|s| !s.is_empty()) {
        summary.push_str(&format!(" Journal snippet: {j}"));
    }
    if let Some(p) = profile_snippet.filter(|s| !s.is_empty()) {
        summary.push_str(&format!(" Profile: {p}"));
    }

    let mut event = HeartbeatEvent::new(EventType::Idle, summary);
    if profile_depth < 5 {
        event.route = Some(Route::Act);
    }
    Some(event)
}

/// Stable dedup key for `HeartbeatState::handled_events`: the hex digest of
/// the event's summary with any `HH:MM` (or `HH:MM:SS`) substrings removed,
/// so the same recurring event still matches across ticks at different
/// times of day.
pub fn normalized_event_key(summary: &str) -> String {
    let stripped = strip_time_of_day(summary);
    let digest = Sha256::digest(stripped.as_bytes());
    hex::encode(digest)
}

fn strip_time_of_day(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if let Some(len) = match_time_token(&text[i..]) {
            i += len;
            continue;
        }
        let ch = text[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Matches `\d{1,2}:\d{2}(:\d{2})?` at the start of `s`, returning its byte
/// length if found.
fn match_time_token(s: &str) -> Option<usize> {
    let mut chars = s.char_indices().peekable();
    let mut digits1 = 0;
    while let Some((_, c)) = chars.peek() {
        if c.is_ascii_digit() && digits1 < 2 {
            digits1 += 1;
            chars.next();
        } else {
            break;
        }
    }
    if digits1 == 0 {
        return None;
    }
    match chars.next() {
        Some((_, ':')) => {}
        _ => return None,
    }
    let mut digits2 = 0;
    while let Some((_, c)) = chars.peek() {
        if c.is_ascii_digit() && digits2 < 2 {
            digits2 += 1;
            chars.next();
        } else {
            break;
        }
    }
    if digits2 != 2 {
        return None;
    }
    let mut end = digits1 + 1 + digits2;
    let rest = &s[end..];
    if let Some(stripped) = rest.strip_prefix(':') {
        let secs: usize = stripped.chars().take_while(|c| c.is_ascii_digit()).count();
        if secs == 2 {
            end += 1 + secs;
        }
    }
    Some(end)
}
