use chrono::Utc;

/// Fixed counting window. Counts are bucketed by epoch, the index of the
/// window a timestamp falls into. A zero-length window never rolls over:
/// every timestamp maps to epoch 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedWindow {
    length_ms: u64,
}

impl FixedWindow {
    pub fn new(length_ms: u64) -> Self {
        Self { length_ms }
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self::new(seconds.saturating_mul(1000))
    }

    /// A window that never resets
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn length_ms(&self) -> u64 {
        self.length_ms
    }

    pub fn is_unbounded(&self) -> bool {
        self.length_ms == 0
    }

    pub fn epoch_at(&self, now_ms: i64) -> u64 {
        if self.length_ms == 0 {
            return 0;
        }
        // timestamps before 1970 all land in the first window
        u64::try_from(now_ms).unwrap_or(0) / self.length_ms
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch_at(now_millis())
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_window_is_always_epoch_zero() {
        let window = FixedWindow::unbounded();
        assert!(window.is_unbounded());
        assert_eq!(window.epoch_at(0), 0);
        assert_eq!(window.epoch_at(1_700_000_000_000), 0);
    }

    #[test]
    fn epochs_advance_on_window_boundaries() {
        let window = FixedWindow::from_seconds(60);
        assert_eq!(window.length_ms(), 60_000);
        assert_eq!(window.epoch_at(59_999), 0);
        assert_eq!(window.epoch_at(60_000), 1);
        assert_eq!(window.epoch_at(125_000), 2);
        assert_eq!(window.epoch_at(-5), 0);
    }
}
