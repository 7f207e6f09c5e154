//! Bounded buffer of Studio server output
//!
//! stdout/stderr lines are forwarded to tracing and kept here so the crash
//! prompt's "View logs" action has something to show.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Maximum number of output lines kept
pub const LOG_MAX_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One captured output line
#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub stream: LogStream,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}] {}",
            self.at.format("%H:%M:%S"),
            self.stream.as_str(),
            self.text
        )
    }
}

#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_MAX_LINES)
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, evicting the oldest once full. Returns the stored line.
    pub fn push(&self, stream: LogStream, text: impl Into<String>) -> LogLine {
        let line = LogLine {
            at: Local::now(),
            stream,
            text: text.into(),
        };
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.clone());
        line
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_lines_in_order() {
        let buffer = LogBuffer::new();
        buffer.push(LogStream::Stdout, "listening");
        buffer.push(LogStream::Stderr, "warning: slow");
        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "listening");
        assert_eq!(lines[1].stream, LogStream::Stderr);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let buffer = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.push(LogStream::Stdout, format!("line {i}"));
        }
        let texts: Vec<_> = buffer.snapshot().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, ["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn display_includes_stream() {
        let buffer = LogBuffer::new();
        let line = buffer.push(LogStream::Stderr, "boom");
        let text = line.to_string();
        assert!(text.contains("stderr"));
        assert!(text.ends_with("boom"));
    }

    #[test]
    fn clear_empties_buffer() {
        let buffer = LogBuffer::new();
        buffer.push(LogStream::Stdout, "x");
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
