use std::time::Duration;

/// Poll interval that widens the longer a lab takes to come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    pub fast: Duration,
    pub medium: Duration,
    pub slow: Duration,
    pub fast_window: Duration,
    pub medium_window: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(2),
            medium: Duration::from_secs(4),
            slow: Duration::from_secs(8),
            fast_window: Duration::from_secs(10),
            medium_window: Duration::from_secs(30),
        }
    }
}

impl PollSchedule {
    pub fn interval(&self, elapsed: Duration) -> Duration {
        if elapsed < self.fast_window {
            self.fast
        } else if elapsed < self.medium_window {
            self.medium
        } else {
            self.slow
        }
    }
}
