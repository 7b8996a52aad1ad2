//! Session configuration.

use std::time::Duration;

/// Link-time base address of a Darwin arm64 main executable.
pub const DEFAULT_LOAD_BASE: u64 = 0x1_0000_0000;

/// How often the death watcher checks that the target still exists.
pub const DEFAULT_DEATH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Knobs for one [`crate::Debugger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Address the main image would load at without ASLR
    pub load_base: u64,
    /// Death watcher poll interval
    pub death_poll_interval: Duration,
    /// Re-enumerate threads on every trap rather than only when a trap
    /// comes from an unknown thread
    pub refresh_threads_on_trap: bool,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            load_base: DEFAULT_LOAD_BASE,
            death_poll_interval: DEFAULT_DEATH_POLL_INTERVAL,
            refresh_threads_on_trap: true,
        }
    }
}

impl SessionConfig
{
    /// Override the load base.
    #[must_use]
    pub const fn with_load_base(mut self, load_base: u64) -> Self
    {
        self.load_base = load_base;
        self
    }

    /// Override the death watcher interval.
    #[must_use]
    pub const fn with_death_poll_interval(mut self, interval: Duration) -> Self
    {
        self.death_poll_interval = interval;
        self
    }

    /// Turn per-trap thread refresh on or off.
    #[must_use]
    pub const fn with_refresh_threads_on_trap(mut self, enabled: bool) -> Self
    {
        self.refresh_threads_on_trap = enabled;
        self
    }
}
