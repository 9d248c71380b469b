use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Contador de ocurrencias dentro de una ventana deslizante.
///
/// Used for reconnect attempts per node and for stuck/exception rates per player.
/// A window of `None` never forgets an occurrence.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    hits: VecDeque<Instant>,
    width: Option<Duration>,
}

impl SlidingWindow {
    pub fn new(width: Option<Duration>) -> Self {
        Self {
            hits: VecDeque::new(),
            width,
        }
    }

    /// Builds a window from a millisecond width where non-positive means unbounded.
    pub fn from_millis(width_ms: i64) -> Self {
        let width = (width_ms > 0).then(|| Duration::from_millis(width_ms as u64));
        Self::new(width)
    }

    /// Records an occurrence at `now` and returns how many fall inside the window.
    pub fn record(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.push_back(now);
        self.hits.len()
    }

    /// Occurrences still inside the window at `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }

    fn prune(&mut self, now: Instant) {
        let Some(width) = self.width else {
            return;
        };

        while let Some(first) = self.hits.front() {
            if now.saturating_duration_since(*first) > width {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_outside_window_are_forgotten() {
        let start = Instant::now();
        let mut window = SlidingWindow::from_millis(1_000);

        assert_eq!(window.record(start), 1);
        assert_eq!(window.record(start + Duration::from_millis(500)), 2);
        assert_eq!(window.record(start + Duration::from_millis(1_400)), 2);
        assert_eq!(window.count(start + Duration::from_millis(5_000)), 0);
    }

    #[test]
    fn test_non_positive_width_counts_everything() {
        let start = Instant::now();
        let mut window = SlidingWindow::from_millis(-1);

        for i in 0..5 {
            window.record(start + Duration::from_secs(i * 3_600));
        }

        assert_eq!(window.count(start + Duration::from_secs(100_000)), 5);

        let mut zero = SlidingWindow::from_millis(0);
        zero.record(start);
        assert_eq!(zero.count(start + Duration::from_secs(60)), 1);
    }
}
