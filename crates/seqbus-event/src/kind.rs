//! Numeric event kind tags used on the wire.

pub const SYSTEM: u8 = 0;
pub const RESULT: u8 = 1;

pub const NOTE: u8 = 5;
pub const NOTE_ON: u8 = 6;
pub const NOTE_OFF: u8 = 7;
pub const KEY_PRESSURE: u8 = 8;

pub const CONTROLLER: u8 = 10;
pub const PROGRAM_CHANGE: u8 = 11;
pub const CHANNEL_PRESSURE: u8 = 12;
pub const PITCH_BEND: u8 = 13;

pub const SONG_POSITION: u8 = 20;
pub const SONG_SELECT: u8 = 21;
pub const QUARTER_FRAME: u8 = 22;
pub const TIME_SIGNATURE: u8 = 23;
pub const KEY_SIGNATURE: u8 = 24;

pub const START: u8 = 30;
pub const CONTINUE: u8 = 31;
pub const STOP: u8 = 32;
pub const SET_POSITION_TICK: u8 = 33;
pub const SET_POSITION_TIME: u8 = 34;
pub const TEMPO: u8 = 35;
pub const CLOCK: u8 = 36;
pub const TICK: u8 = 37;
pub const QUEUE_SKEW: u8 = 38;

pub const TUNE_REQUEST: u8 = 40;
pub const RESET: u8 = 41;
pub const SENSING: u8 = 42;

pub const CLIENT_START: u8 = 60;
pub const CLIENT_EXIT: u8 = 61;
pub const CLIENT_CHANGE: u8 = 62;
pub const PORT_START: u8 = 63;
pub const PORT_EXIT: u8 = 64;
pub const PORT_CHANGE: u8 = 65;
pub const PORT_SUBSCRIBED: u8 = 66;
pub const PORT_UNSUBSCRIBED: u8 = 67;

pub const SYSEX: u8 = 130;
/// First user-defined variable-length kind; carries text events.
pub const USR_VAR0: u8 = 135;

pub const NONE: u8 = 255;

/// Kinds whose payload lives in the variable-length extension.
#[inline]
pub fn is_variable(kind: u8) -> bool {
    (SYSEX..=139).contains(&kind)
}

/// Kinds that describe a change in the client/port directory.
#[inline]
pub fn is_directory_change(kind: u8) -> bool {
    (CLIENT_START..=PORT_CHANGE).contains(&kind)
}
