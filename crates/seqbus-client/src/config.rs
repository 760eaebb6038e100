//! Session configuration.

use crate::error::{Error, Result};
use seqbus_event::OpenMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Real-time scheduling of the input pump thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Try to elevate the pump thread at all (default: true)
    pub enabled: bool,
    /// FIFO priority, 1..=99 (default: 10)
    pub priority: u8,
    /// CPU time the thread may use without blocking before the OS
    /// throttles it; handed to the helper service (default: 200ms)
    pub budget: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 10,
            budget: Duration::from_millis(200),
        }
    }
}

impl RealtimeConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Kernel pool sizes applied when the session opens. `None` keeps the
/// kernel default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub output_pool: Option<usize>,
    pub input_pool: Option<usize>,
    pub output_room: Option<usize>,
}

impl PoolConfig {
    pub fn is_empty(&self) -> bool {
        self.output_pool.is_none() && self.input_pool.is_none() && self.output_room.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Client name pushed to the kernel on open (default: kernel-assigned)
    pub client_name: Option<String>,
    /// Sequencer device (default: "default")
    pub device: String,
    pub mode: OpenMode,
    /// Block on a full output pool instead of buffering locally (default: false)
    pub blocking: bool,
    /// Upper bound on blocking sends; `None` waits forever (default: None)
    pub output_timeout: Option<Duration>,
    pub output_buffer_size: Option<usize>,
    pub input_buffer_size: Option<usize>,
    pub pool: PoolConfig,
    /// Longest wait for input before the pump re-checks its stop flag (default: 500ms)
    pub poll_timeout: Duration,
    /// Exit-signal waits before a stopping pump is abandoned (default: 10)
    pub stop_retries: u32,
    /// Length of each exit-signal wait (default: 100ms)
    pub stop_retry_interval: Duration,
    /// Capacity of the single-subscriber event channel (default: 4096)
    pub event_queue_capacity: usize,
    pub realtime: RealtimeConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: None,
            device: "default".into(),
            mode: OpenMode::Duplex,
            blocking: false,
            output_timeout: None,
            output_buffer_size: None,
            input_buffer_size: None,
            pool: PoolConfig::default(),
            poll_timeout: Duration::from_millis(500),
            stop_retries: 10,
            stop_retry_interval: Duration::from_millis(100),
            event_queue_capacity: 4096,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(Error::InvalidConfig(msg.into()))
        }

        if self.device.trim().is_empty() {
            return invalid("device name is empty");
        }
        if self.poll_timeout.is_zero() {
            return invalid("poll timeout must be non-zero");
        }
        if self.stop_retries == 0 {
            return invalid("stop retries must be at least 1");
        }
        if self.stop_retry_interval.is_zero() {
            return invalid("stop retry interval must be non-zero");
        }
        if self.event_queue_capacity == 0 {
            return invalid("event queue capacity must be non-zero");
        }
        if self.output_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("output timeout must be non-zero");
        }
        if self.output_buffer_size == Some(0) || self.input_buffer_size == Some(0) {
            return invalid("buffer sizes must be non-zero");
        }
        if self.pool.output_pool == Some(0) || self.pool.input_pool == Some(0) {
            return invalid("pool sizes must be non-zero");
        }
        if let (Some(room), Some(pool)) = (self.pool.output_room, self.pool.output_pool) {
            if room > pool {
                return invalid(format!("output room {} exceeds output pool {}", room, pool));
            }
        }
        if !(1..=99).contains(&self.realtime.priority) {
            return invalid(format!(
                "real-time priority {} outside 1..=99",
                self.realtime.priority
            ));
        }
        if self.realtime.enabled && self.realtime.budget.is_zero() {
            return invalid("real-time budget must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.device, "default");
        assert_eq!(config.mode, OpenMode::Duplex);
        assert_eq!(config.poll_timeout, Duration::from_millis(500));
        assert_eq!(config.stop_retries, 10);
        assert_eq!(config.stop_retry_interval, Duration::from_millis(100));
        assert_eq!(config.event_queue_capacity, 4096);
        assert!(config.pool.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let config = SessionConfig {
            poll_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = SessionConfig {
            stop_retry_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            event_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_priority_out_of_range() {
        for priority in [0, 100, 255] {
            let config = SessionConfig {
                realtime: RealtimeConfig {
                    priority,
                    ..Default::default()
                },
                ..Default::default()
            };
            assert!(config.validate().is_err(), "priority {}", priority);
        }
        let config = SessionConfig {
            realtime: RealtimeConfig {
                priority: 99,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_room_larger_than_pool() {
        let config = SessionConfig {
            pool: PoolConfig {
                output_pool: Some(10),
                output_room: Some(11),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
