//! Queue records: identity, status, tempo/skew and timer.

use crate::address::ClientId;
use crate::kind;
use crate::time::RealTime;
use serde::{Deserialize, Serialize};

pub type QueueId = u8;

/// Fixed skew denominator; the skew factor is `skew_value / SKEW_BASE`.
pub const SKEW_BASE: u32 = 0x10000;
pub const DEFAULT_PPQ: u32 = 96;
/// 120 BPM.
pub const DEFAULT_TEMPO_USEC: u32 = 500_000;

const USEC_PER_MINUTE: f64 = 6e7;

/// Actions carried by queue control events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueControl {
    Start,
    Stop,
    Continue,
    SetTickPosition(u32),
    SetTimePosition(RealTime),
    Skew { value: u32, base: u32 },
    Clock,
    Tick,
}

impl QueueControl {
    pub fn kind(self) -> u8 {
        match self {
            QueueControl::Start => kind::START,
            QueueControl::Stop => kind::STOP,
            QueueControl::Continue => kind::CONTINUE,
            QueueControl::SetTickPosition(_) => kind::SET_POSITION_TICK,
            QueueControl::SetTimePosition(_) => kind::SET_POSITION_TIME,
            QueueControl::Skew { .. } => kind::QUEUE_SKEW,
            QueueControl::Clock => kind::CLOCK,
            QueueControl::Tick => kind::TICK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueInfo {
    pub queue: QueueId,
    pub name: String,
    pub owner: ClientId,
    /// Only the owner may control a locked queue.
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: QueueId,
    pub running: bool,
    /// Events still waiting in the queue.
    pub events: usize,
    pub tick: u32,
    pub time: RealTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTempo {
    pub queue: QueueId,
    /// Parts per quarter note.
    pub ppq: u32,
    pub usec_per_beat: u32,
    pub skew_value: u32,
    pub skew_base: u32,
}

impl Default for QueueTempo {
    fn default() -> Self {
        Self {
            queue: 0,
            ppq: DEFAULT_PPQ,
            usec_per_beat: DEFAULT_TEMPO_USEC,
            skew_value: SKEW_BASE,
            skew_base: SKEW_BASE,
        }
    }
}

impl QueueTempo {
    pub fn new(queue: QueueId) -> Self {
        Self {
            queue,
            ..Default::default()
        }
    }

    /// Tempo ignoring skew.
    pub fn nominal_bpm(&self) -> f64 {
        if self.usec_per_beat == 0 {
            return 0.0;
        }
        USEC_PER_MINUTE / self.usec_per_beat as f64
    }

    /// Tempo including skew: `nominal * value / base`.
    pub fn real_bpm(&self) -> f64 {
        if self.skew_base == 0 {
            return self.nominal_bpm();
        }
        self.nominal_bpm() * self.skew_value as f64 / self.skew_base as f64
    }

    /// Non-positive or non-finite values are ignored.
    pub fn set_nominal_bpm(&mut self, bpm: f64) {
        if !(bpm.is_finite() && bpm > 0.0) {
            return;
        }
        self.usec_per_beat = (USEC_PER_MINUTE / bpm).floor().min(u32::MAX as f64) as u32;
    }

    pub fn tempo_factor(&self) -> f64 {
        if self.skew_base == 0 {
            return 1.0;
        }
        self.skew_value as f64 / self.skew_base as f64
    }

    /// Sets `skew_value = floor(SKEW_BASE * factor)` and resets the base.
    pub fn set_tempo_factor(&mut self, factor: f64) {
        if !(factor.is_finite() && factor >= 0.0) {
            return;
        }
        self.skew_base = SKEW_BASE;
        self.skew_value = (SKEW_BASE as f64 * factor).floor().min(u32::MAX as f64) as u32;
    }

    /// Queue time advance in nanoseconds for one tick at the current tempo.
    pub fn nanos_per_tick(&self) -> f64 {
        if self.ppq == 0 {
            return 0.0;
        }
        self.usec_per_beat as f64 * 1000.0 / self.ppq as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimerSource {
    #[default]
    System,
    HighResolution,
    Pcm {
        card: u32,
        device: u32,
        subdevice: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueTimer {
    pub queue: QueueId,
    pub source: TimerSource,
    /// Timer resolution in Hz.
    pub resolution: u32,
}
