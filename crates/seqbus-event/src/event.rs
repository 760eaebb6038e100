//! Sequencer events: a scheduling envelope around a typed payload.

use crate::address::{Address, ClientId, Destination};
use crate::kind;
use crate::queue::{QueueControl, QueueId};
use crate::time::{RealTime, Schedule};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// What happened to a client or port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Notice {
    Start,
    Exit,
    Change,
}

/// Payload kinds of the generic value event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    SongPosition,
    SongSelect,
    QuarterFrame,
    TimeSignature,
    KeySignature,
}

impl ValueKind {
    pub fn kind(self) -> u8 {
        match self {
            ValueKind::SongPosition => kind::SONG_POSITION,
            ValueKind::SongSelect => kind::SONG_SELECT,
            ValueKind::QuarterFrame => kind::QUARTER_FRAME,
            ValueKind::TimeSignature => kind::TIME_SIGNATURE,
            ValueKind::KeySignature => kind::KEY_SIGNATURE,
        }
    }

    pub fn from_kind(kind: u8) -> Option<Self> {
        Some(match kind {
            kind::SONG_POSITION => ValueKind::SongPosition,
            kind::SONG_SELECT => ValueKind::SongSelect,
            kind::QUARTER_FRAME => ValueKind::QuarterFrame,
            kind::TIME_SIGNATURE => ValueKind::TimeSignature,
            kind::KEY_SIGNATURE => ValueKind::KeySignature,
            _ => return None,
        })
    }
}

/// Data-less system messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemKind {
    TuneRequest,
    Reset,
    ActiveSensing,
}

impl SystemKind {
    pub fn kind(self) -> u8 {
        match self {
            SystemKind::TuneRequest => kind::TUNE_REQUEST,
            SystemKind::Reset => kind::RESET,
            SystemKind::ActiveSensing => kind::SENSING,
        }
    }

    pub fn from_kind(kind: u8) -> Option<Self> {
        Some(match kind {
            kind::TUNE_REQUEST => SystemKind::TuneRequest,
            kind::RESET => SystemKind::Reset,
            kind::SENSING => SystemKind::ActiveSensing,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventData {
    /// Note with an explicit duration; receivers emit the matching note-off.
    Note {
        channel: u8,
        note: u8,
        velocity: u8,
        off_velocity: u8,
        duration: u32,
    },
    NoteOn {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    NoteOff {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    KeyPressure {
        channel: u8,
        note: u8,
        pressure: u8,
    },
    Controller {
        channel: u8,
        param: u32,
        value: i32,
    },
    ProgramChange {
        channel: u8,
        program: i32,
    },
    ChannelPressure {
        channel: u8,
        pressure: i32,
    },
    /// Signed bend, -8192..=8191, 0 = center.
    PitchBend {
        channel: u8,
        value: i32,
    },
    SysEx(Vec<u8>),
    Text {
        text_type: u8,
        text: String,
    },
    Tempo {
        queue: QueueId,
        usec_per_beat: u32,
    },
    Queue {
        queue: QueueId,
        control: QueueControl,
    },
    Client {
        notice: Notice,
        client: ClientId,
    },
    Port {
        notice: Notice,
        address: Address,
    },
    Subscription {
        subscribed: bool,
        sender: Address,
        dest: Address,
    },
    Value {
        kind: ValueKind,
        channel: u8,
        value: i32,
    },
    System(SystemKind),
    /// A kind this library does not model; only the envelope is meaningful.
    Unknown {
        kind: u8,
        raw: [u8; 12],
    },
}

impl EventData {
    /// Wire kind tag of this payload.
    pub fn kind(&self) -> u8 {
        match self {
            EventData::Note { .. } => kind::NOTE,
            EventData::NoteOn { .. } => kind::NOTE_ON,
            EventData::NoteOff { .. } => kind::NOTE_OFF,
            EventData::KeyPressure { .. } => kind::KEY_PRESSURE,
            EventData::Controller { .. } => kind::CONTROLLER,
            EventData::ProgramChange { .. } => kind::PROGRAM_CHANGE,
            EventData::ChannelPressure { .. } => kind::CHANNEL_PRESSURE,
            EventData::PitchBend { .. } => kind::PITCH_BEND,
            EventData::SysEx(_) => kind::SYSEX,
            EventData::Text { .. } => kind::USR_VAR0,
            EventData::Tempo { .. } => kind::TEMPO,
            EventData::Queue { control, .. } => control.kind(),
            EventData::Client { notice, .. } => match notice {
                Notice::Start => kind::CLIENT_START,
                Notice::Exit => kind::CLIENT_EXIT,
                Notice::Change => kind::CLIENT_CHANGE,
            },
            EventData::Port { notice, .. } => match notice {
                Notice::Start => kind::PORT_START,
                Notice::Exit => kind::PORT_EXIT,
                Notice::Change => kind::PORT_CHANGE,
            },
            EventData::Subscription { subscribed, .. } => {
                if *subscribed {
                    kind::PORT_SUBSCRIBED
                } else {
                    kind::PORT_UNSUBSCRIBED
                }
            }
            EventData::Value { kind, .. } => kind.kind(),
            EventData::System(kind) => kind.kind(),
            EventData::Unknown { kind, .. } => *kind,
        }
    }
}

/// A sequencer event: payload plus addressing and scheduling envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequencerEvent {
    pub source: Address,
    pub dest: Destination,
    pub schedule: Schedule,
    pub priority: Priority,
    /// Opaque correlation tag, usable as a removal criterion.
    pub tag: u8,
    pub data: EventData,
}

impl SequencerEvent {
    pub fn new(data: EventData) -> Self {
        Self {
            source: Address::default(),
            dest: Destination::Subscribers,
            schedule: Schedule::Immediate,
            priority: Priority::Normal,
            tag: 0,
            data,
        }
    }

    // ==================== Payload constructors ====================

    pub fn note(channel: u8, note: u8, velocity: u8, duration: u32) -> Self {
        Self::new(EventData::Note {
            channel: channel.min(15),
            note: note & 0x7F,
            velocity: velocity & 0x7F,
            off_velocity: 0,
            duration,
        })
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(EventData::NoteOn {
            channel: channel.min(15),
            note: note & 0x7F,
            velocity: velocity & 0x7F,
        })
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(EventData::NoteOff {
            channel: channel.min(15),
            note: note & 0x7F,
            velocity: velocity & 0x7F,
        })
    }

    pub fn key_pressure(channel: u8, note: u8, pressure: u8) -> Self {
        Self::new(EventData::KeyPressure {
            channel: channel.min(15),
            note: note & 0x7F,
            pressure: pressure & 0x7F,
        })
    }

    pub fn controller(channel: u8, param: u32, value: i32) -> Self {
        Self::new(EventData::Controller {
            channel: channel.min(15),
            param,
            value,
        })
    }

    pub fn program_change(channel: u8, program: i32) -> Self {
        Self::new(EventData::ProgramChange {
            channel: channel.min(15),
            program,
        })
    }

    pub fn channel_pressure(channel: u8, pressure: i32) -> Self {
        Self::new(EventData::ChannelPressure {
            channel: channel.min(15),
            pressure,
        })
    }

    /// `value`: signed 14-bit (-8192 to 8191).
    pub fn pitch_bend(channel: u8, value: i32) -> Self {
        Self::new(EventData::PitchBend {
            channel: channel.min(15),
            value: value.clamp(-8192, 8191),
        })
    }

    pub fn sysex(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(EventData::SysEx(bytes.into()))
    }

    pub fn text(text_type: u8, text: impl Into<String>) -> Self {
        Self::new(EventData::Text {
            text_type,
            text: text.into(),
        })
    }

    pub fn tempo(queue: QueueId, usec_per_beat: u32) -> Self {
        Self::new(EventData::Tempo {
            queue,
            usec_per_beat,
        })
        .to(Address::SYSTEM_TIMER)
    }

    /// Control event addressed to the system timer port.
    pub fn queue_control(queue: QueueId, control: QueueControl) -> Self {
        Self::new(EventData::Queue { queue, control }).to(Address::SYSTEM_TIMER)
    }

    pub fn value(kind: ValueKind, channel: u8, value: i32) -> Self {
        Self::new(EventData::Value {
            kind,
            channel: channel.min(15),
            value,
        })
    }

    pub fn system(kind: SystemKind) -> Self {
        Self::new(EventData::System(kind))
    }

    // ==================== Envelope builders ====================

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    pub fn to(mut self, dest: impl Into<Destination>) -> Self {
        self.dest = dest.into();
        self
    }

    pub fn to_subscribers(mut self) -> Self {
        self.dest = Destination::Subscribers;
        self
    }

    pub fn to_broadcast(mut self) -> Self {
        self.dest = Destination::Broadcast;
        self
    }

    pub fn direct(mut self) -> Self {
        self.schedule = Schedule::Immediate;
        self
    }

    pub fn at_tick(mut self, queue: QueueId, tick: u32) -> Self {
        self.schedule = Schedule::Tick {
            queue,
            tick,
            relative: false,
        };
        self
    }

    pub fn after_ticks(mut self, queue: QueueId, ticks: u32) -> Self {
        self.schedule = Schedule::Tick {
            queue,
            tick: ticks,
            relative: true,
        };
        self
    }

    pub fn at_time(mut self, queue: QueueId, time: RealTime) -> Self {
        self.schedule = Schedule::RealTime {
            queue,
            time,
            relative: false,
        };
        self
    }

    pub fn after_time(mut self, queue: QueueId, time: RealTime) -> Self {
        self.schedule = Schedule::RealTime {
            queue,
            time,
            relative: true,
        };
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.priority = Priority::High;
        self
    }

    pub fn tagged(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    // ==================== Inspection ====================

    #[inline]
    pub fn kind(&self) -> u8 {
        self.data.kind()
    }

    pub fn channel(&self) -> Option<u8> {
        match &self.data {
            EventData::Note { channel, .. }
            | EventData::NoteOn { channel, .. }
            | EventData::NoteOff { channel, .. }
            | EventData::KeyPressure { channel, .. }
            | EventData::Controller { channel, .. }
            | EventData::ProgramChange { channel, .. }
            | EventData::ChannelPressure { channel, .. }
            | EventData::PitchBend { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    #[inline]
    pub fn is_channel(&self) -> bool {
        self.channel().is_some()
    }

    /// Note-off, or note-on with zero velocity.
    pub fn is_note_off(&self) -> bool {
        matches!(
            self.data,
            EventData::NoteOff { .. } | EventData::NoteOn { velocity: 0, .. }
        )
    }

    pub fn is_client(&self) -> bool {
        matches!(self.data, EventData::Client { .. })
    }

    pub fn is_port(&self) -> bool {
        matches!(self.data, EventData::Port { .. })
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self.data, EventData::Subscription { .. })
    }

    /// Client, port or subscription notification.
    pub fn is_connection_change(&self) -> bool {
        self.is_client() || self.is_port() || self.is_subscription()
    }

    /// Notifications that invalidate a cached client directory.
    pub fn is_directory_change(&self) -> bool {
        kind::is_directory_change(self.kind())
    }
}
