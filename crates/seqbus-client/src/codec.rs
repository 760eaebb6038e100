//! Conversion between [`SequencerEvent`] and [`RawRecord`].
//!
//! Payload layouts inside the 12 data bytes:
//!
//! | kinds | layout |
//! |---|---|
//! | note family | channel, note, velocity, off velocity, duration (u32 LE @4) |
//! | controller family, values | channel, 3 unused, param (u32 LE @4), value (i32 LE @8) |
//! | queue control, tempo | queue, 3 unused, 8 parameter bytes @4 |
//! | client notice | client |
//! | port notice | client, port |
//! | subscription notice | sender client, sender port, dest client, dest port |
//! | text | text type; string in the extension |

use crate::error::DecodeError;
use crate::kernel::{RawRecord, RecordFlags, QUEUE_DIRECT};
use seqbus_event::address::{ADDRESS_BROADCAST, ADDRESS_SUBSCRIBERS};
use seqbus_event::{
    kind, Address, Destination, EventData, Notice, Priority, QueueControl, RealTime, Schedule,
    SequencerEvent, SystemKind, ValueKind,
};

pub fn encode(event: &SequencerEvent) -> RawRecord {
    let mut record = RawRecord::new(event.kind());
    record.tag = event.tag;
    record.source = event.source;
    record.dest = match event.dest {
        Destination::Subscribers => Address::new(ADDRESS_SUBSCRIBERS, 0),
        Destination::Broadcast => Address::new(ADDRESS_BROADCAST, 0),
        Destination::Address(addr) => addr,
    };
    if event.priority == Priority::High {
        record.flags.insert(RecordFlags::HIGH_PRIORITY);
    }

    match event.schedule {
        Schedule::Immediate => record.queue = QUEUE_DIRECT,
        Schedule::Tick {
            queue,
            tick,
            relative,
        } => {
            record.queue = queue;
            record.set_tick(tick);
            record.flags.set(RecordFlags::RELATIVE, relative);
        }
        Schedule::RealTime {
            queue,
            time,
            relative,
        } => {
            record.queue = queue;
            record.set_real_time(time);
            record.flags.set(RecordFlags::RELATIVE, relative);
        }
    }

    encode_payload(&event.data, &mut record);
    record
}

fn encode_payload(data: &EventData, record: &mut RawRecord) {
    match data {
        EventData::Note {
            channel,
            note,
            velocity,
            off_velocity,
            duration,
        } => {
            record.data[..4].copy_from_slice(&[*channel, *note, *velocity, *off_velocity]);
            record.put_u32(4, *duration);
        }
        EventData::NoteOn {
            channel,
            note,
            velocity,
        }
        | EventData::NoteOff {
            channel,
            note,
            velocity,
        } => {
            record.data[..3].copy_from_slice(&[*channel, *note, *velocity]);
        }
        EventData::KeyPressure {
            channel,
            note,
            pressure,
        } => {
            record.data[..3].copy_from_slice(&[*channel, *note, *pressure]);
        }
        EventData::Controller {
            channel,
            param,
            value,
        } => put_control(record, *channel, *param, *value),
        EventData::ProgramChange { channel, program } => put_control(record, *channel, 0, *program),
        EventData::ChannelPressure { channel, pressure } => {
            put_control(record, *channel, 0, *pressure)
        }
        EventData::PitchBend { channel, value } => put_control(record, *channel, 0, *value),
        EventData::Value {
            channel, value, ..
        } => put_control(record, *channel, 0, *value),
        EventData::SysEx(bytes) => {
            record.flags.insert(RecordFlags::VARIABLE);
            record.ext = bytes.clone();
        }
        EventData::Text { text_type, text } => {
            record.flags.insert(RecordFlags::VARIABLE);
            record.data[0] = *text_type;
            record.ext = text.as_bytes().to_vec();
        }
        EventData::Tempo {
            queue,
            usec_per_beat,
        } => {
            record.data[0] = *queue;
            record.put_u32(4, *usec_per_beat);
        }
        EventData::Queue { queue, control } => {
            record.data[0] = *queue;
            match control {
                QueueControl::SetTickPosition(tick) => record.put_u32(4, *tick),
                QueueControl::SetTimePosition(time) => {
                    record.put_u32(4, time.sec);
                    record.put_u32(8, time.nsec);
                }
                QueueControl::Skew { value, base } => {
                    record.put_u32(4, *value);
                    record.put_u32(8, *base);
                }
                QueueControl::Start
                | QueueControl::Stop
                | QueueControl::Continue
                | QueueControl::Clock
                | QueueControl::Tick => {}
            }
        }
        EventData::Client { client, .. } => record.data[0] = *client,
        EventData::Port { address, .. } => {
            record.data[0] = address.client;
            record.data[1] = address.port;
        }
        EventData::Subscription { sender, dest, .. } => {
            record.data[..4].copy_from_slice(&[sender.client, sender.port, dest.client, dest.port]);
        }
        EventData::System(_) => {}
        EventData::Unknown { raw, .. } => record.data = *raw,
    }
}

fn put_control(record: &mut RawRecord, channel: u8, param: u32, value: i32) {
    record.data[0] = channel;
    record.put_u32(4, param);
    record.put_i32(8, value);
}

pub fn decode(record: &RawRecord) -> Result<SequencerEvent, DecodeError> {
    let data = decode_payload(record)?;

    let dest = match record.dest.client {
        ADDRESS_SUBSCRIBERS => Destination::Subscribers,
        ADDRESS_BROADCAST => Destination::Broadcast,
        _ => Destination::Address(record.dest),
    };
    let relative = record.is_relative();
    let schedule = if record.queue == QUEUE_DIRECT {
        Schedule::Immediate
    } else if record.is_real_time() {
        Schedule::RealTime {
            queue: record.queue,
            time: record.real_time(),
            relative,
        }
    } else {
        Schedule::Tick {
            queue: record.queue,
            tick: record.tick(),
            relative,
        }
    };
    let priority = if record.flags.contains(RecordFlags::HIGH_PRIORITY) {
        Priority::High
    } else {
        Priority::Normal
    };

    Ok(SequencerEvent {
        source: record.source,
        dest,
        schedule,
        priority,
        tag: record.tag,
        data,
    })
}

fn decode_payload(record: &RawRecord) -> Result<EventData, DecodeError> {
    let d = &record.data;
    let data = match record.kind {
        kind::NOTE => EventData::Note {
            channel: channel(record),
            note: d[1],
            velocity: d[2],
            off_velocity: d[3],
            duration: record.u32_at(4),
        },
        kind::NOTE_ON => EventData::NoteOn {
            channel: channel(record),
            note: d[1],
            velocity: d[2],
        },
        kind::NOTE_OFF => EventData::NoteOff {
            channel: channel(record),
            note: d[1],
            velocity: d[2],
        },
        kind::KEY_PRESSURE => EventData::KeyPressure {
            channel: channel(record),
            note: d[1],
            pressure: d[2],
        },
        kind::CONTROLLER => EventData::Controller {
            channel: channel(record),
            param: record.u32_at(4),
            value: record.i32_at(8),
        },
        kind::PROGRAM_CHANGE => EventData::ProgramChange {
            channel: channel(record),
            program: record.i32_at(8),
        },
        kind::CHANNEL_PRESSURE => EventData::ChannelPressure {
            channel: channel(record),
            pressure: record.i32_at(8),
        },
        kind::PITCH_BEND => EventData::PitchBend {
            channel: channel(record),
            value: record.i32_at(8),
        },
        kind::SYSEX => {
            require_ext(record)?;
            EventData::SysEx(record.ext.clone())
        }
        kind::USR_VAR0 => {
            require_ext(record)?;
            let text =
                String::from_utf8(record.ext.clone()).map_err(|_| DecodeError::InvalidText)?;
            EventData::Text {
                text_type: d[0],
                text,
            }
        }
        kind::TEMPO => EventData::Tempo {
            queue: d[0],
            usec_per_beat: record.u32_at(4),
        },
        kind::START
        | kind::STOP
        | kind::CONTINUE
        | kind::SET_POSITION_TICK
        | kind::SET_POSITION_TIME
        | kind::QUEUE_SKEW
        | kind::CLOCK
        | kind::TICK => EventData::Queue {
            queue: d[0],
            control: queue_control(record),
        },
        kind::CLIENT_START | kind::CLIENT_EXIT | kind::CLIENT_CHANGE => EventData::Client {
            notice: notice(record.kind - kind::CLIENT_START),
            client: d[0],
        },
        kind::PORT_START | kind::PORT_EXIT | kind::PORT_CHANGE => EventData::Port {
            notice: notice(record.kind - kind::PORT_START),
            address: Address::new(d[0], d[1]),
        },
        kind::PORT_SUBSCRIBED | kind::PORT_UNSUBSCRIBED => EventData::Subscription {
            subscribed: record.kind == kind::PORT_SUBSCRIBED,
            sender: Address::new(d[0], d[1]),
            dest: Address::new(d[2], d[3]),
        },
        other => {
            if let Some(value_kind) = ValueKind::from_kind(other) {
                EventData::Value {
                    kind: value_kind,
                    channel: channel(record),
                    value: record.i32_at(8),
                }
            } else if let Some(system) = SystemKind::from_kind(other) {
                EventData::System(system)
            } else {
                EventData::Unknown {
                    kind: other,
                    raw: *d,
                }
            }
        }
    };
    Ok(data)
}

/// Passed through untouched; the kernel does not range-check it either.
fn channel(record: &RawRecord) -> u8 {
    record.data[0]
}

fn require_ext(record: &RawRecord) -> Result<(), DecodeError> {
    if record.flags.contains(RecordFlags::VARIABLE) {
        Ok(())
    } else {
        Err(DecodeError::MissingExtension(record.kind))
    }
}

fn notice(offset: u8) -> Notice {
    match offset {
        0 => Notice::Start,
        1 => Notice::Exit,
        _ => Notice::Change,
    }
}

fn queue_control(record: &RawRecord) -> QueueControl {
    match record.kind {
        kind::START => QueueControl::Start,
        kind::STOP => QueueControl::Stop,
        kind::CONTINUE => QueueControl::Continue,
        kind::SET_POSITION_TICK => QueueControl::SetTickPosition(record.u32_at(4)),
        kind::SET_POSITION_TIME => {
            QueueControl::SetTimePosition(RealTime::new(record.u32_at(4), record.u32_at(8)))
        }
        kind::QUEUE_SKEW => QueueControl::Skew {
            value: record.u32_at(4),
            base: record.u32_at(8),
        },
        kind::CLOCK => QueueControl::Clock,
        _ => QueueControl::Tick,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::RECORD_HEADER_SIZE;

    #[test]
    fn test_note_layout() {
        let event = SequencerEvent::note(2, 60, 100, 480).with_source(Address::new(128, 0));
        let record = encode(&event);
        assert_eq!(record.kind, kind::NOTE);
        assert_eq!(&record.data[..4], &[2, 60, 100, 0]);
        assert_eq!(record.u32_at(4), 480);
        assert_eq!(record.dest.client, ADDRESS_SUBSCRIBERS);
        assert_eq!(record.queue, QUEUE_DIRECT);
        assert_eq!(decode(&record).unwrap(), event);
    }

    #[test]
    fn test_schedule_flags() {
        let event = SequencerEvent::controller(0, 7, -3)
            .to(Address::new(129, 1))
            .after_time(2, RealTime::new(1, 500))
            .high_priority()
            .tagged(4);
        let record = encode(&event);
        assert_eq!(record.queue, 2);
        assert!(record.is_real_time() && record.is_relative());
        assert!(record.flags.contains(RecordFlags::HIGH_PRIORITY));
        assert_eq!(record.time, [1, 500]);
        assert_eq!(record.i32_at(8), -3);
        assert_eq!(decode(&record).unwrap(), event);
    }

    #[test]
    fn test_text_goes_to_extension() {
        let event = SequencerEvent::text(3, "lyric");
        let record = encode(&event);
        assert!(record.flags.contains(RecordFlags::VARIABLE));
        assert_eq!(record.ext, b"lyric");
        assert_eq!(record.size(), RECORD_HEADER_SIZE + 5);
        assert_eq!(decode(&record).unwrap(), event);
    }

    #[test]
    fn test_invalid_text_is_an_error() {
        let mut record = encode(&SequencerEvent::text(1, "x"));
        record.ext = vec![0xFF, 0xFE];
        assert_eq!(decode(&record), Err(DecodeError::InvalidText));

        record.flags.remove(RecordFlags::VARIABLE);
        assert_eq!(
            decode(&record),
            Err(DecodeError::MissingExtension(kind::USR_VAR0))
        );
    }

    #[test]
    fn test_out_of_range_channel_passes_through() {
        let mut record = encode(&SequencerEvent::note_on(0, 60, 1));
        record.data[0] = 19;
        let event = decode(&record).unwrap();
        assert_eq!(event.channel(), Some(19));
        assert_eq!(encode(&event).data[0], 19);
    }

    #[test]
    fn test_unknown_kind_keeps_envelope() {
        let mut record = RawRecord::new(99);
        record.source = Address::new(130, 2);
        record.dest = Address::new(128, 0);
        record.tag = 7;
        record.data[0] = 0xAB;
        let event = decode(&record).unwrap();
        assert_eq!(event.kind(), 99);
        assert_eq!(event.source, Address::new(130, 2));
        assert_eq!(event.tag, 7);
        match event.data {
            EventData::Unknown { kind, raw } => {
                assert_eq!(kind, 99);
                assert_eq!(raw[0], 0xAB);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_queue_control_parameters() {
        for control in [
            QueueControl::Start,
            QueueControl::SetTickPosition(1920),
            QueueControl::SetTimePosition(RealTime::new(3, 250)),
            QueueControl::Skew {
                value: 0x8000,
                base: 0x10000,
            },
        ] {
            let event = SequencerEvent::queue_control(1, control);
            let decoded = decode(&encode(&event)).unwrap();
            assert_eq!(decoded.data, EventData::Queue { queue: 1, control });
            assert_eq!(decoded.dest, Destination::Address(Address::SYSTEM_TIMER));
        }
    }

    #[test]
    fn test_notifications() {
        let mut record = RawRecord::new(kind::PORT_SUBSCRIBED);
        record.data[..4].copy_from_slice(&[128, 0, 129, 1]);
        let event = decode(&record).unwrap();
        assert_eq!(
            event.data,
            EventData::Subscription {
                subscribed: true,
                sender: Address::new(128, 0),
                dest: Address::new(129, 1),
            }
        );

        let mut record = RawRecord::new(kind::CLIENT_EXIT);
        record.data[0] = 131;
        let event = decode(&record).unwrap();
        assert_eq!(
            event.data,
            EventData::Client {
                notice: Notice::Exit,
                client: 131
            }
        );
        assert!(event.is_directory_change());
    }
}
