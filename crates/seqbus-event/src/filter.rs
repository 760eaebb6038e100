//! Criteria for removing not-yet-delivered events.

use crate::address::Destination;
use crate::event::SequencerEvent;
use crate::queue::QueueId;
use crate::time::{Schedule, Timestamp};
use serde::{Deserialize, Serialize};

/// Filter over pending events. Unset fields match anything; set fields
/// must all match.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoveCriteria {
    /// Apply to the client's input FIFO.
    pub input: bool,
    /// Apply to events waiting in output (local buffer and kernel pool).
    pub output: bool,
    pub channel: Option<u8>,
    pub kind: Option<u8>,
    pub queue: Option<QueueId>,
    pub tag: Option<u8>,
    pub dest: Option<Destination>,
    /// Only events scheduled strictly before this time.
    pub before: Option<Timestamp>,
    /// Only events scheduled at or after this time.
    pub after: Option<Timestamp>,
    /// Keep note-offs so removed notes do not hang.
    pub ignore_note_off: bool,
}

impl RemoveCriteria {
    pub fn output() -> Self {
        Self {
            output: true,
            ..Default::default()
        }
    }

    pub fn input() -> Self {
        Self {
            input: true,
            ..Default::default()
        }
    }

    pub fn both() -> Self {
        Self {
            input: true,
            output: true,
            ..Default::default()
        }
    }

    pub fn channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn kind(mut self, kind: u8) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn queue(mut self, queue: QueueId) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn tag(mut self, tag: u8) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn dest(mut self, dest: impl Into<Destination>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn before(mut self, time: Timestamp) -> Self {
        self.before = Some(time);
        self
    }

    pub fn after(mut self, time: Timestamp) -> Self {
        self.after = Some(time);
        self
    }

    pub fn ignore_note_off(mut self, ignore: bool) -> Self {
        self.ignore_note_off = ignore;
        self
    }

    pub fn matches(&self, event: &SequencerEvent) -> bool {
        if self.ignore_note_off && event.is_note_off() {
            return false;
        }
        if let Some(channel) = self.channel {
            if event.channel() != Some(channel) {
                return false;
            }
        }
        if self.kind.is_some_and(|kind| kind != event.kind()) {
            return false;
        }
        if self.tag.is_some_and(|tag| tag != event.tag) {
            return false;
        }
        if self.dest.is_some_and(|dest| dest != event.dest) {
            return false;
        }
        if let Some(queue) = self.queue {
            if event.schedule.queue() != Some(queue) {
                return false;
            }
        }
        if let Some(before) = self.before {
            if !time_cmp(&event.schedule, before).is_some_and(|o| o.is_lt()) {
                return false;
            }
        }
        if let Some(after) = self.after {
            if !time_cmp(&event.schedule, after).is_some_and(|o| o.is_ge()) {
                return false;
            }
        }
        true
    }
}

/// Compares an event's schedule to a threshold on the same time axis.
/// Immediate events and mismatched axes are incomparable.
fn time_cmp(schedule: &Schedule, threshold: Timestamp) -> Option<std::cmp::Ordering> {
    match (schedule.timestamp()?, threshold) {
        (Timestamp::Tick(a), Timestamp::Tick(b)) => Some(a.cmp(&b)),
        (Timestamp::Real(a), Timestamp::Real(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}
