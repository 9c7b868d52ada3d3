//! Log ring (C5): per-function bounded, timestamped log buffer.
//!
//! Policy: newest-wins eviction — once the ring is full, `append` drops the
//! oldest line to make room, never the newest. `append` is O(1) and must
//! never block call execution.

use std::collections::VecDeque;
use std::sync::Mutex;
use time::OffsetDateTime;

/// Default ring capacity, overridable via the engine's own config.
pub const DEFAULT_LOG_RING_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub line: String,
}

/// A fixed-capacity circular buffer of log lines for one function.
pub struct LogRing {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append a line, evicting the oldest entry if the ring is full.
    pub fn append(&self, line: impl Into<String>) {
        let mut entries = self.entries.lock().expect("log ring mutex poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: OffsetDateTime::now_utc(),
            line: line.into(),
        });
    }

    /// Query entries, oldest-first.
    ///
    /// - `since`: if `Some`, only entries at or after `now - since`.
    /// - `tail`: if `Some`, cap the result to the last `tail` entries.
    pub fn query(&self, since: Option<std::time::Duration>, tail: Option<usize>) -> Vec<LogEntry> {
        let entries = self.entries.lock().expect("log ring mutex poisoned");
        let mut result: Vec<LogEntry> = match since {
            Some(since) => {
                let cutoff = OffsetDateTime::now_utc() - since;
                entries
                    .iter()
                    .filter(|e| e.timestamp >= cutoff)
                    .cloned()
                    .collect()
            }
            None => entries.iter().cloned().collect(),
        };

        if let Some(tail) = tail {
            if result.len() > tail {
                result = result.split_off(result.len() - tail);
            }
        }

        result
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("log ring mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_past_capacity_drops_oldest_not_newest() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.append(format!("line-{i}"));
        }
        let all = ring.query(None, None);
        let lines: Vec<&str> = all.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["line-2", "line-3", "line-4"]);
    }

    #[test]
    fn tail_caps_to_last_n_oldest_first() {
        let ring = LogRing::new(10);
        for i in 0..10 {
            ring.append(format!("line-{i}"));
        }
        let last_three = ring.query(None, Some(3));
        let lines: Vec<&str> = last_three.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["line-7", "line-8", "line-9"]);
    }

    #[test]
    fn since_filters_by_age() {
        let ring = LogRing::new(10);
        ring.append("old");
        std::thread::sleep(std::time::Duration::from_millis(20));
        ring.append("new");

        let recent = ring.query(Some(std::time::Duration::from_millis(5)), None);
        let lines: Vec<&str> = recent.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["new"]);
    }

    #[test]
    fn empty_ring_queries_empty() {
        let ring = LogRing::new(10);
        assert!(ring.query(None, None).is_empty());
        assert!(ring.is_empty());
    }
}
