use std::time::Duration;
use tokio::time::Instant;

/// Default spacing between fog broadcasts while painting (about 20 Hz).
pub const DEFAULT_PAINT_INTERVAL: Duration = Duration::from_millis(50);

/// Rate limiter for paint-drag broadcasts.
///
/// Calls inside the interval are refused and remembered as pending so the caller
/// can flush the final state once the interval has passed.
#[derive(Debug, Clone)]
pub struct PaintThrottle {
    min_interval: Duration,
    last: Option<Instant>,
    pending: bool,
}

impl PaintThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
            pending: false,
        }
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => {
                self.pending = true;
                false
            }
            _ => {
                self.last = Some(now);
                self.pending = false;
                true
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// When a pending call may go through.
    pub fn ready_at(&self) -> Option<Instant> {
        if !self.pending {
            return None;
        }
        self.last.map(|last| last + self.min_interval)
    }
}

impl Default for PaintThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PAINT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_inside_interval_and_remembers() {
        let start = Instant::now();
        let mut throttle = PaintThrottle::default();

        assert!(throttle.admit(start));
        assert!(!throttle.admit(start + Duration::from_millis(10)));
        assert!(throttle.is_pending());
        assert_eq!(throttle.ready_at(), Some(start + DEFAULT_PAINT_INTERVAL));

        assert!(throttle.admit(start + Duration::from_millis(50)));
        assert!(!throttle.is_pending());
        assert_eq!(throttle.ready_at(), None);
    }

    #[test]
    fn zero_interval_never_throttles() {
        let now = Instant::now();
        let mut throttle = PaintThrottle::new(Duration::ZERO);
        assert!(throttle.admit(now));
        assert!(throttle.admit(now));
    }
}
