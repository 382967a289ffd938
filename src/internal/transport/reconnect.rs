use std::time::Duration;

/// Exponential backoff policy for replacing a dead transport.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// 0 disables reconnection entirely: every failure is fatal.
    pub max_attempts: u32,
}

/// Per-server backoff progress, owned by the transport manager. Reset to
/// zero whenever a connection reaches `Connected`.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl ReconnectPolicy {
    /// `min(max_delay, base_delay * multiplier^attempt)`. Deterministic
    /// given the attempt counter; no jitter.
    pub fn next_delay(&self, state: &ReconnectState) -> Duration {
        // Clamp in f64 space: high attempt counts overflow Duration
        // multiplication long before the cap would apply.
        let factor = self.multiplier.powf(f64::from(state.attempt));
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn should_retry(&self, state: &ReconnectState) -> bool {
        state.attempt < self.max_attempts
    }
}
