use std::time::Duration;

use bon::Builder;

use crate::error::ConfigError;
use crate::hw::{ConnectOptions, ScanFilter};
use crate::notification::DEFAULT_LOG_CAPACITY;

pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_millis(20_000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(15_000);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_REQUESTED_MTU: u16 = 512;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Timing and policy knobs for a [`SessionController`](super::SessionController).
///
/// ```
/// use std::time::Duration;
///
/// let config = periph::SessionConfig::builder()
///     .connect_timeout(Duration::from_secs(5))
///     .auto_reconnect(true)
///     .build();
/// assert_eq!(Duration::from_secs(20), config.scan_duration());
/// assert!(config.auto_reconnect());
/// ```
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    #[builder(default = DEFAULT_SCAN_DURATION)]
    scan_duration: Duration,
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
    #[builder(default = DEFAULT_RECONNECT_DELAY)]
    reconnect_delay: Duration,
    #[builder(default = DEFAULT_REQUESTED_MTU)]
    requested_mtu: u16,
    #[builder(default)]
    auto_connect: bool,
    /// Initial auto-reconnect policy; can be toggled while running.
    #[builder(default)]
    auto_reconnect: bool,
    /// Upper bound on consecutive reconnect attempts. `None` retries forever.
    max_reconnect_attempts: Option<u32>,
    #[builder(default = DEFAULT_LOG_CAPACITY)]
    log_capacity: usize,
    #[builder(default = DEFAULT_EVENT_CAPACITY)]
    event_capacity: usize,
    #[builder(default)]
    scan_filter: ScanFilter,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn scan_duration(&self) -> Duration {
        self.scan_duration
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    #[must_use]
    pub fn requested_mtu(&self) -> u16 {
        self.requested_mtu
    }

    #[must_use]
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    #[must_use]
    pub fn max_reconnect_attempts(&self) -> Option<u32> {
        self.max_reconnect_attempts
    }

    #[must_use]
    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    #[must_use]
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    #[must_use]
    pub fn scan_filter(&self) -> &ScanFilter {
        &self.scan_filter
    }

    /// Options sent with every connection request.
    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::builder()
            .mtu(self.requested_mtu)
            .timeout(self.connect_timeout)
            .auto_connect(self.auto_connect)
            .build()
    }

    /// Rejects zero durations and capacities.
    ///
    /// # Errors
    ///
    /// Returns the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("scan_duration", self.scan_duration),
            ("connect_timeout", self.connect_timeout),
            ("reconnect_delay", self.reconnect_delay),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        for (name, value) in [
            ("log_capacity", self.log_capacity),
            ("event_capacity", self.event_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity { name });
            }
        }
        Ok(())
    }
}
