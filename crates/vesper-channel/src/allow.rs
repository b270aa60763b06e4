//! Allowlist enforcement for inbound channel messages.
//!
//! Deny-by-default: an empty list means no one is allowed. Wildcard `"*"`
//! allows everyone. Entries may match a sender name or a numeric/string ID,
//! with or without a leading `@`.

pub fn is_allowed(allowlist: &[String], sender_name: &str, sender_id: &str) -> bool {
    if allowlist.is_empty() {
        return false;
    }
    allowlist.iter().any(|entry| {
        let entry = entry.trim_start_matches('@');
        entry == "*" || entry == sender_name || entry == sender_id
    })
}
