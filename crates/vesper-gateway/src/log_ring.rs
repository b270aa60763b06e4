//! In-memory ring buffer backing `GET /api/gateway/log`. Implemented as a
//! `tracing_subscriber::fmt::MakeWriter` so it taps the same formatted
//! output as the stdout subscriber, rather than duplicating formatting
//! logic — a second sink layered onto the same `tracing_subscriber::fmt()`
//! initialization used for stdout.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

const MAX_LINES: usize = 500;

#[derive(Clone)]
pub struct LogRing {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self { lines: Arc::new(Mutex::new(VecDeque::with_capacity(MAX_LINES))) }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }

    fn push(&self, chunk: &str) {
        let mut lines = self.lines.lock().unwrap();
        for line in chunk.lines() {
            if lines.len() >= MAX_LINES {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RingWriter(LogRing);

impl io::Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.push(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogRing {
    type Writer = RingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RingWriter(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_splits_into_lines_and_caps_capacity() {
        let ring = LogRing::new();
        for i in 0..(MAX_LINES + 10) {
            ring.push(&format!("line {i}\n"));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), MAX_LINES);
        assert_eq!(snap.last().unwrap(), &format!("line {}", MAX_LINES + 9));
    }
}
