//! Chunking and markdown escaping for outbound channel messages. These
//! operate on plain strings, independent of any particular bot-API client.
//!
//! Telegram's message limit is 4096 characters; 4090 is used for safety
//! margin. Other channels with a different limit can still reuse
//! `split_chunks_smart` by passing their own `max` value.

/// Code-fence-aware message splitter.
///
/// When a split falls inside a fenced code block, the fence is closed
/// before the chunk boundary and re-opened at the start of the next chunk.
pub fn split_chunks_smart(text: &str, max: usize) -> Vec<String> {
    if text.len() <= max {
        return vec![text.to_string()];
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in &lines {
        let cost = if current.is_empty() { line.len() } else { 1 + line.len() };

        if !current.is_empty() && current.len() + cost > max {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(ref lang) = fence_lang {
                if lang.is_empty() {
                    current.push_str("```\n");
                } else {
                    current.push_str("```");
                    current.push_str(lang);
                    current.push('\n');
                }
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after_fence) = trimmed.strip_prefix("```") {
            if fence_lang.is_some() {
                fence_lang = None;
            } else {
                fence_lang = Some(after_fence.trim().to_string());
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= max {
            result.push(chunk);
        } else {
            let mut remaining = chunk.as_str();
            while remaining.len() > max {
                let split_at = remaining[..max]
                    .rfind('\n')
                    .or_else(|| remaining[..max].rfind(' '))
                    .unwrap_or(max);
                result.push(remaining[..split_at].to_string());
                remaining = remaining[split_at..].trim_start();
            }
            if !remaining.is_empty() {
                result.push(remaining.to_string());
            }
        }
    }

    result
}

/// Escape special characters for Telegram MarkdownV2.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '#' | '+' | '-' | '=' | '|' | '{' | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}
