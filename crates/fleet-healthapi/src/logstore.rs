//! In-memory ring buffer of structured log entries, fed by a
//! `tracing_subscriber::Layer` so `/api/logs` can paginate and filter
//! without re-parsing the rotated `agent.log` file on every request.
//! The rotating file sink (tracing-appender, wired up by the agent
//! binary) remains the durable copy; this is a bounded, queryable tail.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const DEFAULT_CAPACITY: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Clone)]
pub struct LogRingBuffer {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl LogRingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut buf = self.inner.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(entry);
    }

    /// Returns entries newest-first, optionally filtered by minimum level
    /// and a case-insensitive message substring, then paged.
    pub fn query(&self, page: usize, page_size: usize, level: Option<&str>, search: Option<&str>) -> (Vec<LogEntry>, usize) {
        let buf = self.inner.lock();
        let search = search.map(|s| s.to_lowercase());
        let filtered: Vec<LogEntry> = buf
            .iter()
            .rev()
            .filter(|e| level.map(|l| e.level.eq_ignore_ascii_case(l)).unwrap_or(true))
            .filter(|e| search.as_deref().map(|s| e.message.to_lowercase().contains(s)).unwrap_or(true))
            .cloned()
            .collect();

        let total = filtered.len();
        let start = page.saturating_sub(1) * page_size;
        let page_items = filtered.into_iter().skip(start).take(page_size).collect();
        (page_items, total)
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.inner.lock().iter().cloned().collect()
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A `tracing_subscriber::Layer` that mirrors every event into a
/// [`LogRingBuffer`]. Installed alongside the fmt/file layers the agent
/// binary sets up; never itself writes to stdout or disk.
pub struct RingBufferLayer {
    buffer: LogRingBuffer,
}

impl RingBufferLayer {
    pub fn new(buffer: LogRingBuffer) -> Self {
        Self { buffer }
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for RingBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.buffer.push(LogEntry {
            timestamp: Utc::now(),
            level: level_str(*event.metadata().level()).to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn ring_buffer_caps_at_capacity() {
        let buf = LogRingBuffer::with_capacity(3);
        for i in 0..5 {
            buf.push(entry("info", &format!("msg-{i}")));
        }
        let all = buf.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "msg-2");
    }

    #[test]
    fn query_filters_by_level_and_search() {
        let buf = LogRingBuffer::with_capacity(10);
        buf.push(entry("info", "disk ok"));
        buf.push(entry("error", "disk full"));
        buf.push(entry("warn", "disk at 80%"));

        let (items, total) = buf.query(1, 10, Some("error"), None);
        assert_eq!(total, 1);
        assert_eq!(items[0].message, "disk full");

        let (items, total) = buf.query(1, 10, None, Some("DISK"));
        assert_eq!(total, 3);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn query_returns_newest_first_and_pages() {
        let buf = LogRingBuffer::with_capacity(10);
        for i in 0..5 {
            buf.push(entry("info", &format!("msg-{i}")));
        }
        let (page1, total) = buf.query(1, 2, None, None);
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].message, "msg-4");

        let (page2, _) = buf.query(2, 2, None, None);
        assert_eq!(page2[0].message, "msg-2");
    }
}
