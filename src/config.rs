use std::time::Duration;

pub const DEFAULT_PROCESSING_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BOTS: usize = 100;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_COMPLETED_RETENTION: usize = 100;

/// Knobs injected into a [`crate::dispatcher::Dispatcher`] at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How long a bot works on one order. Restarts in full after a requeue.
    pub processing_duration: Duration,
    /// Upper bound on the bot pool.
    pub max_bots: usize,
    /// Buffered events per subscriber before slow receivers start lagging.
    pub event_capacity: usize,
    /// Completed orders kept for status views; older ones are dropped but
    /// still counted.
    pub completed_retention: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            processing_duration: DEFAULT_PROCESSING_DURATION,
            max_bots: DEFAULT_MAX_BOTS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
        }
    }
}

impl DispatcherConfig {
    pub fn with_processing_duration(mut self, duration: Duration) -> Self {
        self.processing_duration = duration;
        self
    }

    pub fn with_max_bots(mut self, max_bots: usize) -> Self {
        self.max_bots = max_bots;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_completed_retention(mut self, keep: usize) -> Self {
        self.completed_retention = keep;
        self
    }
}
