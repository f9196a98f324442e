//! Engine tuning knobs.

use std::time::Duration;

/// How often a suspended run re-polls its control source.
pub const DEFAULT_CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runtime configuration shared by every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Poll period while paused, and the slice length of pausable sleeps.
    pub control_poll_interval: Duration,
}

impl EngineConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.control_poll_interval = interval.max(Duration::from_millis(1));
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_poll_interval: DEFAULT_CONTROL_POLL_INTERVAL,
        }
    }
}
