//! Per-session input history with up/down navigation.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// Session used when a client does not identify itself.
pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Default)]
struct HistoryBuffer {
    entries: VecDeque<String>,
    /// `None` while not navigating (fresh input line).
    cursor: Option<usize>,
}

impl HistoryBuffer {
    fn push(&mut self, input: String, limit: Option<usize>) {
        self.entries.push_back(input);
        if let Some(limit) = limit {
            while self.entries.len() > limit.max(1) {
                self.entries.pop_front();
                self.cursor = None;
            }
        }
    }

    fn last(&self) -> Option<&str> {
        self.entries.back().map(String::as_str)
    }

    fn at_cursor(&self) -> String {
        self.cursor
            .and_then(|i| self.entries.get(i))
            .cloned()
            .unwrap_or_default()
    }
}

/// Recall of previously submitted input for one session.
///
/// An empty string from [`navigate_up`](Self::navigate_up) or
/// [`navigate_down`](Self::navigate_down) means "nothing to apply".
#[derive(Debug, Default)]
pub struct HistoryRecall {
    buffer: RwLock<HistoryBuffer>,
    limit: Option<usize>,
}

impl HistoryRecall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` entries, evicting the oldest.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: RwLock::new(HistoryBuffer::default()),
            limit: Some(limit),
        }
    }

    /// Store a submitted line. Empty lines and repeats of the last entry are
    /// ignored; a stored line ends any navigation in progress.
    pub fn record(&self, input: &str) {
        let mut buf = self.buffer.write();
        if input.is_empty() || buf.last() == Some(input) {
            return;
        }
        buf.push(input.to_string(), self.limit);
        buf.cursor = None;
    }

    /// Step back through history.
    ///
    /// A non-empty `current` that differs from the newest entry is an unsent
    /// draft: it is stashed as the newest entry and returned unchanged, so it
    /// can be revisited like any other line.
    pub fn navigate_up(&self, current: &str) -> String {
        let mut buf = self.buffer.write();
        if buf.entries.is_empty() {
            return String::new();
        }

        if !current.is_empty() && buf.last() != Some(current) {
            buf.push(current.to_string(), self.limit);
            buf.cursor = Some(buf.entries.len() - 1);
            return current.to_string();
        }

        buf.cursor = match buf.cursor {
            None => Some(buf.entries.len() - 1),
            Some(i) if i > 0 => Some(i - 1),
            other => other,
        };
        buf.at_cursor()
    }

    /// Step forward through history. Moving past the newest entry ends
    /// navigation and returns an empty line.
    pub fn navigate_down(&self) -> String {
        let mut buf = self.buffer.write();
        let Some(cursor) = buf.cursor else {
            return String::new();
        };
        if buf.entries.is_empty() {
            return String::new();
        }
        if cursor + 1 < buf.entries.len() {
            buf.cursor = Some(cursor + 1);
            buf.at_cursor()
        } else {
            buf.cursor = None;
            String::new()
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current cursor; `-1` when not navigating.
    pub fn position(&self) -> isize {
        self.buffer
            .read()
            .cursor
            .map(|c| c as isize)
            .unwrap_or(-1)
    }

    pub fn entries(&self) -> Vec<String> {
        self.buffer.read().entries.iter().cloned().collect()
    }
}

/// One [`HistoryRecall`] per session, created on first use.
#[derive(Debug, Default)]
pub struct HistoryRegistry {
    sessions: DashMap<String, Arc<HistoryRecall>>,
    limit: Option<usize>,
}

impl HistoryRegistry {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            sessions: DashMap::new(),
            limit,
        }
    }

    pub fn session(&self, session: &str) -> Arc<HistoryRecall> {
        let session = if session.is_empty() { DEFAULT_SESSION } else { session };
        if let Some(existing) = self.sessions.get(session) {
            return Arc::clone(existing.value());
        }
        let limit = self.limit;
        Arc::clone(
            self.sessions
                .entry(session.to_string())
                .or_insert_with(|| {
                    Arc::new(match limit {
                        Some(limit) => HistoryRecall::with_limit(limit),
                        None => HistoryRecall::new(),
                    })
                })
                .value(),
        )
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
