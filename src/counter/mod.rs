//! Per-worker request counters
//!
//! A worker's view of how many requests each source identifier has made in
//! the current window. Local admissions and remote sync events both land
//! here; nothing in this module talks to other workers.
pub mod window;

use papaya::HashMap;

pub use window::{now_millis, FixedWindow};

/// Count for one identifier inside one window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowCount {
    pub epoch: u64,
    pub count: u64,
}

impl WindowCount {
    fn first(epoch: u64) -> Self {
        Self { epoch, count: 1 }
    }

    /// Add one request counted in `epoch`. A different epoch means the
    /// stored window is over and this request opens a new one.
    fn record(&self, epoch: u64) -> Self {
        if epoch == self.epoch {
            Self {
                epoch,
                count: self.count.saturating_add(1),
            }
        } else {
            Self::first(epoch)
        }
    }
}

/// Mapping from source identifier to its request count in the current
/// fixed window.
///
/// Owned by exactly one worker. Sharing between the HTTP handlers and the
/// sync listener of that worker happens through an `Arc`; the map itself is
/// lock-free so neither side blocks the other.
pub struct CounterStore {
    window: FixedWindow,
    counts: HashMap<String, WindowCount>,
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("window", &self.window)
            .field("identifiers", &self.counts.len())
            .finish()
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new(FixedWindow::unbounded())
    }
}

impl CounterStore {
    pub fn new(window: FixedWindow) -> Self {
        Self {
            window,
            counts: HashMap::new(),
        }
    }

    pub fn window(&self) -> FixedWindow {
        self.window
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Count one locally observed request and return the new count
    pub fn increment(&self, id: &str) -> u64 {
        self.increment_at(id, now_millis())
    }

    pub fn increment_at(&self, id: &str, now_ms: i64) -> u64 {
        let epoch = self.window.epoch_at(now_ms);
        self.counts
            .pin()
            .update_or_insert_with(
                id.to_string(),
                |current| current.record(epoch),
                || WindowCount::first(epoch),
            )
            .count
    }

    /// Current-window count for `id`, 0 when unseen or expired
    pub fn get(&self, id: &str) -> u64 {
        self.get_at(id, now_millis())
    }

    pub fn get_at(&self, id: &str, now_ms: i64) -> u64 {
        let epoch = self.window.epoch_at(now_ms);
        match self.counts.pin().get(id) {
            Some(entry) if entry.epoch == epoch => entry.count,
            _ => 0,
        }
    }

    /// Count one request another worker observed. `epoch` is the window the
    /// remote worker counted it in; `None` means "whatever window is current
    /// here". A peer whose clock runs ahead is counted in the current window
    /// rather than opening a future one. Never publishes anything.
    pub fn apply_remote(&self, id: &str, epoch: Option<u64>) -> u64 {
        self.apply_remote_at(id, epoch, now_millis())
    }

    pub fn apply_remote_at(&self, id: &str, epoch: Option<u64>, now_ms: i64) -> u64 {
        let current = self.window.epoch_at(now_ms);
        let epoch = epoch.map_or(current, |epoch| epoch.min(current));
        if epoch < current {
            // the window this increment belongs to is already over
            return self.get_at(id, now_ms);
        }
        self.counts
            .pin()
            .update_or_insert_with(
                id.to_string(),
                |existing| existing.record(current),
                || WindowCount::first(current),
            )
            .count
    }

    /// Drop every identifier whose window has passed, to keep the map from
    /// growing without bound. Returns the number of entries removed.
    pub fn expire_stale(&self) -> usize {
        self.expire_stale_at(now_millis())
    }

    pub fn expire_stale_at(&self, now_ms: i64) -> usize {
        if self.window.is_unbounded() {
            return 0;
        }
        let epoch = self.window.epoch_at(now_ms);
        let before = self.counts.len();
        self.counts.pin().retain(|_id, entry| entry.epoch == epoch);
        before.saturating_sub(self.counts.len())
    }

    /// Snapshot of all current counts
    pub fn snapshot(&self) -> std::collections::HashMap<String, WindowCount> {
        let mut result = std::collections::HashMap::new();
        let pin = self.counts.pin();
        for (key, value) in pin.iter() {
            result.insert(key.clone(), *value);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    fn windowed_store() -> CounterStore {
        CounterStore::new(FixedWindow::from_seconds(60))
    }

    #[test]
    fn increment_then_get_is_immediate() {
        let store = CounterStore::default();
        assert_eq!(store.get("10.0.0.1"), 0);
        assert_eq!(store.increment("10.0.0.1"), 1);
        assert_eq!(store.get("10.0.0.1"), 1);
        assert_eq!(store.increment("10.0.0.1"), 2);
        assert_eq!(store.get("10.0.0.1"), 2);
        assert_eq!(store.get("10.0.0.2"), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remote_increments_add_to_local_ones() {
        let store = CounterStore::default();
        store.increment("a");
        assert_eq!(store.apply_remote("a", None), 2);
        assert_eq!(store.apply_remote("b", None), 1);
        assert_eq!(store.get("a"), 2);
        assert_eq!(store.get("b"), 1);
    }

    #[test]
    fn unbounded_window_never_resets() {
        let store = CounterStore::default();
        store.increment_at("a", 0);
        store.increment_at("a", 10 * MINUTE);
        assert_eq!(store.get_at("a", 1_000 * MINUTE), 2);
        assert_eq!(store.expire_stale_at(1_000 * MINUTE), 0);
    }

    #[test]
    fn counts_reset_when_the_window_rolls_over() {
        let store = windowed_store();
        store.increment_at("a", 1_000);
        store.increment_at("a", 2_000);
        assert_eq!(store.get_at("a", 59_000), 2);
        // next window
        assert_eq!(store.get_at("a", MINUTE + 1), 0);
        assert_eq!(store.increment_at("a", MINUTE + 1), 1);
        assert_eq!(store.get_at("a", MINUTE + 2), 1);
    }

    #[test]
    fn remote_events_for_past_windows_are_dropped() {
        let store = windowed_store();
        store.increment_at("a", MINUTE + 5);
        // event counted by a peer in the previous window
        assert_eq!(store.apply_remote_at("a", Some(0), MINUTE + 10), 1);
        // event from the current window counts
        assert_eq!(store.apply_remote_at("a", Some(1), MINUTE + 10), 2);
        // unknown epoch is taken as the current one
        assert_eq!(store.apply_remote_at("a", None, MINUTE + 10), 3);
    }

    #[test]
    fn remote_event_from_a_future_window_counts_in_the_current_one() {
        let store = windowed_store();
        for _ in 0..4 {
            store.increment_at("a", 30_000);
        }
        // a peer whose clock already crossed the boundary
        assert_eq!(store.apply_remote_at("a", Some(1), 30_000), 5);
        assert_eq!(store.get_at("a", 30_000), 5);
        // later current-window events still count
        assert_eq!(store.apply_remote_at("a", Some(0), 30_000), 6);
        assert_eq!(store.get_at("a", 30_000), 6);
        // and the window still resets on time
        assert_eq!(store.get_at("a", MINUTE), 0);
    }

    #[test]
    fn expire_stale_drops_only_old_windows() {
        let store = windowed_store();
        store.increment_at("old", 1_000);
        store.increment_at("fresh", MINUTE + 1_000);
        assert_eq!(store.expire_stale_at(MINUTE + 2_000), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_at("fresh", MINUTE + 2_000), 1);
        let snapshot = store.snapshot();
        assert!(snapshot.contains_key("fresh"));
        assert!(!snapshot.contains_key("old"));
    }
}
