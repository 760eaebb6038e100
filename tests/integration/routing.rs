//! Port-to-port delivery and queue scheduling tests

use crate::helpers::*;
use approx::assert_relative_eq;
use seqbus::prelude::*;
use seqbus::EventData;
use std::sync::Arc;

fn note_of(event: &SequencerEvent) -> Option<u8> {
    match event.data {
        EventData::NoteOn { note, .. } => Some(note),
        _ => None,
    }
}

#[test]
fn test_note_reaches_subscribed_client() {
    let bus = test_bus();
    let mut player = test_session(&bus, "player");
    let mut synth = test_session(&bus, "synth");

    let out = player.create_port(PortInfo::duplex("out")).unwrap();
    synth.create_port(PortInfo::duplex("in")).unwrap();
    let target = player.resolve_address("synth:0").unwrap();
    player.port(&out).unwrap().subscribe_to(target).unwrap();

    let events = synth.events();
    synth.start_input().unwrap();

    player
        .port(&out)
        .unwrap()
        .send(SequencerEvent::note_on(0, 64, 90).to_subscribers())
        .unwrap();
    player.drain_output().unwrap();

    let event = events.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(note_of(&event), Some(64));
    assert_eq!(event.source, out.address());
}

#[test]
fn test_listener_receives_broadcast_copy() {
    let bus = test_bus();
    let mut player = test_session(&bus, "player");
    let mut synth = test_session(&bus, "synth");

    let out = player.create_port(PortInfo::duplex("out")).unwrap();
    let sink = synth.create_port(PortInfo::duplex("in")).unwrap();
    synth.port(&sink).unwrap().subscribe_from(out.address()).unwrap();

    let (tx_a, rx_a) = crossbeam_channel::bounded::<SequencerEvent>(8);
    let (tx_b, rx_b) = crossbeam_channel::bounded::<SequencerEvent>(8);
    synth.add_listener(Arc::new(tx_a));
    synth.add_listener(Arc::new(tx_b));
    synth.set_events_enabled(true);
    synth.start_input().unwrap();

    player
        .port(&out)
        .unwrap()
        .send_direct(SequencerEvent::note_on(1, 40, 10).to_subscribers())
        .unwrap();

    assert_eq!(note_of(&rx_a.recv_timeout(RECV_TIMEOUT).unwrap()), Some(40));
    assert_eq!(note_of(&rx_b.recv_timeout(RECV_TIMEOUT).unwrap()), Some(40));
}

#[test]
fn test_shared_queue_tempo() {
    let bus = test_bus();
    let mut owner = test_session(&bus, "owner");
    let mut guest = test_session(&bus, "guest");

    let queue = owner.create_queue("shared").unwrap();
    owner.queue().unwrap().set_nominal_bpm(90.0).unwrap();

    guest.use_queue_name("shared").unwrap();
    assert_eq!(guest.queue_id(), Some(queue));
    let scheduler = guest.queue().unwrap();
    assert!(!scheduler.is_owned());
    assert_relative_eq!(scheduler.nominal_bpm().unwrap(), 90.0, epsilon = 1e-6);
}
