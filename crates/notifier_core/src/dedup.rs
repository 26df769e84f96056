use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use shared::domain::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    Duplicate,
}

/// Time-bounded record of event keys already routed on one connection.
///
/// Expired entries are swept lazily, at most once per window, so memory is
/// bounded by the number of events that arrive within roughly two windows.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    entries: HashMap<EventId, Instant>,
    last_sweep: Option<Instant>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
            last_sweep: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn seen(&mut self, key: &EventId) -> Admission {
        self.seen_at(key, Instant::now())
    }

    pub fn seen_at(&mut self, key: &EventId, now: Instant) -> Admission {
        self.sweep(now);

        if let Some(inserted_at) = self.entries.get(key) {
            if now.saturating_duration_since(*inserted_at) < self.window {
                return Admission::Duplicate;
            }
        }

        self.entries.insert(key.clone(), now);
        Admission::Fresh
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&mut self, now: Instant) {
        let due = self
            .last_sweep
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window);
        if !due {
            return;
        }
        let window = self.window;
        self.entries
            .retain(|_, inserted_at| now.saturating_duration_since(*inserted_at) < window);
        self.last_sweep = Some(now);
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
