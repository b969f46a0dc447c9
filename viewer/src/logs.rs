//! Bounded log buffer with filter and search views.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use logscope_core::{current_timestamp, LogEvent, LogLevel};

/// Default capacity of the log buffer.
pub const DEFAULT_MAX_LOGS: usize = 500;

/// A single captured log line. Immutable once buffered; evicted
/// oldest-first when the buffer is full.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Unique id, stable for list rendering.
    pub id: String,
    /// Unix milliseconds at append time.
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
    /// Original payload, when the frame was structured.
    pub raw: Option<Value>,
}

/// Level predicate for [`LogBuffer::view`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelFilter {
    All,
    Level(LogLevel),
}

impl LevelFilter {
    pub fn matches(&self, level: LogLevel) -> bool {
        match self {
            LevelFilter::All => true,
            LevelFilter::Level(wanted) => *wanted == level,
        }
    }
}

impl Default for LevelFilter {
    // The dashboard historically opens on plain `log` output.
    fn default() -> Self {
        LevelFilter::Level(LogLevel::Log)
    }
}

/// FIFO buffer of log entries with a hard capacity bound. Insertion
/// order is preserved across eviction.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    pub level_filter: LevelFilter,
    pub search_text: String,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_MAX_LOGS)),
            capacity: capacity.max(1),
            level_filter: LevelFilter::default(),
            search_text: String::new(),
        }
    }

    /// Append a decoded event, evicting the oldest entry when full.
    pub fn append(&mut self, event: LogEvent) {
        let timestamp = current_timestamp();
        let id = format!("{}-{}", timestamp, Uuid::new_v4().simple());
        self.push(LogEntry {
            id,
            timestamp,
            level: event.level,
            message: event.message,
            raw: event.raw,
        });
    }

    /// Append a session-local bookkeeping entry (connect/disconnect/
    /// error notices). These never travel over the wire.
    pub fn append_session(&mut self, level: LogLevel, cause: &str, message: String) {
        let timestamp = current_timestamp();
        self.push(LogEntry {
            id: format!("{}-system-{}", timestamp, cause),
            timestamp,
            level,
            message,
            raw: None,
        });
    }

    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Lazy projection over the buffer: level must match the filter and
    /// the message must contain the search text case-insensitively.
    /// Never mutates the buffer.
    pub fn view<'a>(
        &'a self,
        filter: LevelFilter,
        search: &str,
    ) -> impl Iterator<Item = &'a LogEntry> + 'a {
        let needle = search.trim().to_lowercase();
        self.entries.iter().filter(move |entry| {
            filter.matches(entry.level)
                && (needle.is_empty() || entry.message.to_lowercase().contains(&needle))
        })
    }

    /// Materialize the view with the buffer's own filter settings.
    pub fn filtered(&self) -> Vec<LogEntry> {
        self.view(self.level_filter, &self.search_text)
            .cloned()
            .collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        LogBuffer::new(DEFAULT_MAX_LOGS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(level: LogLevel, message: &str) -> LogEvent {
        LogEvent {
            level,
            message: message.to_string(),
            raw: None,
        }
    }

    #[test]
    fn eviction_keeps_most_recent_in_order() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..4 {
            buffer.append(event(LogLevel::Log, &format!("line {}", i)));
        }
        assert_eq!(buffer.len(), 3);
        let messages: Vec<_> = buffer.entries().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["line 1", "line 2", "line 3"]);
    }

    #[test]
    fn capacity_plus_one_inserts_keep_capacity_entries() {
        let capacity = 500;
        let mut buffer = LogBuffer::new(capacity);
        for i in 0..=capacity {
            buffer.append(event(LogLevel::Info, &format!("{}", i)));
        }
        assert_eq!(buffer.len(), capacity);
        assert_eq!(buffer.entries().next().map(|e| e.message.as_str()), Some("1"));
    }

    #[test]
    fn view_filters_by_level_and_search() {
        let mut buffer = LogBuffer::new(10);
        buffer.append(event(LogLevel::Warn, "Disk almost full"));
        buffer.append(event(LogLevel::Info, "disk rotated"));
        buffer.append(event(LogLevel::Warn, "network flaky"));

        let warnings: Vec<_> = buffer
            .view(LevelFilter::Level(LogLevel::Warn), "")
            .collect();
        assert_eq!(warnings.len(), 2);

        let disk: Vec<_> = buffer.view(LevelFilter::All, "DISK").collect();
        assert_eq!(disk.len(), 2);

        let warn_disk: Vec<_> = buffer
            .view(LevelFilter::Level(LogLevel::Warn), "disk")
            .collect();
        assert_eq!(warn_disk.len(), 1);
        assert_eq!(warn_disk[0].message, "Disk almost full");
    }

    #[test]
    fn view_is_restartable() {
        let mut buffer = LogBuffer::new(10);
        buffer.append(event(LogLevel::Log, "a"));
        buffer.append(event(LogLevel::Log, "b"));
        assert_eq!(buffer.view(LevelFilter::All, "").count(), 2);
        assert_eq!(buffer.view(LevelFilter::All, "").count(), 2);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut buffer = LogBuffer::new(10);
        buffer.append(event(LogLevel::Log, "x"));
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let mut buffer = LogBuffer::new(10);
        buffer.append(event(LogLevel::Log, "x"));
        buffer.append(event(LogLevel::Log, "x"));
        let ids: Vec<_> = buffer.entries().map(|e| e.id.clone()).collect();
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn default_filter_shows_plain_log_only() {
        let mut buffer = LogBuffer::new(10);
        buffer.append(event(LogLevel::Log, "plain"));
        buffer.append(event(LogLevel::Debug, "noise"));
        let filtered = buffer.filtered();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].message, "plain");
    }
}
