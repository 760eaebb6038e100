//! Musical and wall-clock time stamps.

use crate::queue::QueueId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Seconds + nanoseconds, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RealTime {
    pub sec: u32,
    pub nsec: u32,
}

impl RealTime {
    pub const ZERO: RealTime = RealTime { sec: 0, nsec: 0 };

    /// Normalizes `nsec` overflow into seconds.
    pub fn new(sec: u32, nsec: u32) -> Self {
        Self {
            sec: sec.saturating_add(nsec / NANOS_PER_SEC),
            nsec: nsec % NANOS_PER_SEC,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.sec as u64, self.nsec)
    }

    pub fn as_nanos(&self) -> u64 {
        self.sec as u64 * NANOS_PER_SEC as u64 + self.nsec as u64
    }

    pub fn saturating_add(self, other: RealTime) -> RealTime {
        RealTime::from(self.as_duration() + other.as_duration())
    }
}

impl From<Duration> for RealTime {
    fn from(d: Duration) -> Self {
        Self {
            sec: d.as_secs().min(u32::MAX as u64) as u32,
            nsec: d.subsec_nanos(),
        }
    }
}

impl From<RealTime> for Duration {
    fn from(t: RealTime) -> Self {
        t.as_duration()
    }
}

/// A point on one of a queue's two time axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timestamp {
    Tick(u32),
    Real(RealTime),
}

/// When the kernel should deliver an event.
///
/// On input the same field carries the receive time stamp of ports with
/// time stamping enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Schedule {
    #[default]
    Immediate,
    Tick {
        queue: QueueId,
        tick: u32,
        relative: bool,
    },
    RealTime {
        queue: QueueId,
        time: RealTime,
        relative: bool,
    },
}

impl Schedule {
    #[inline]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Schedule::Immediate)
    }

    pub fn queue(&self) -> Option<QueueId> {
        match self {
            Schedule::Immediate => None,
            Schedule::Tick { queue, .. } | Schedule::RealTime { queue, .. } => Some(*queue),
        }
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Schedule::Immediate => None,
            Schedule::Tick { tick, .. } => Some(Timestamp::Tick(*tick)),
            Schedule::RealTime { time, .. } => Some(Timestamp::Real(*time)),
        }
    }

    pub fn is_relative(&self) -> bool {
        match self {
            Schedule::Immediate => false,
            Schedule::Tick { relative, .. } | Schedule::RealTime { relative, .. } => *relative,
        }
    }
}
