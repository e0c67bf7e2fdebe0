use std::time::Duration;

pub const DEBUG_ENV: &str = "NONCRAST_DEBUG";

#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub default_duration: Duration,
    /// Cadence of the display recompute.
    pub refresh_interval: Duration,
    /// Persist progress every N refresh ticks.
    pub heartbeat_every_ticks: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(30 * 60),
            refresh_interval: Duration::from_millis(200),
            heartbeat_every_ticks: 50,
        }
    }
}

impl TimerConfig {
    /// Defaults, with a heartbeat on every tick when `NONCRAST_DEBUG` is set.
    pub fn from_env() -> Self {
        let debug_mode = std::env::var(DEBUG_ENV)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            heartbeat_every_ticks: if debug_mode { 1 } else { 50 },
            ..Self::default()
        }
    }

    pub fn default_duration_ms(&self) -> u64 {
        self.default_duration.as_millis() as u64
    }
}
