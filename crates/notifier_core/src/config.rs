use std::time::Duration;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Tunables shared by every connection the supervisor owns.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub dedup_window: Duration,
    pub discovery_timeout: Duration,
    pub join_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    /// Platforms where background delivery is unreliable also get an OS
    /// notification while in the foreground.
    pub constrained_platform: bool,
    pub preview_chars: usize,
    pub event_buffer: usize,
    pub stop_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            max_reconnect_attempts: 8,
            reconnect_initial_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(30),
            constrained_platform: false,
            preview_chars: 140,
            event_buffer: 1024,
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl EngineSettings {
    /// Exponential backoff for the given 1-based reconnect attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_initial_backoff
            .saturating_mul(1u32 << exponent);
        delay.min(self.reconnect_max_backoff)
    }
}
