//! Port records and subscriptions.

use crate::address::{Address, ClientId, PortId};
use crate::queue::QueueId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// What other clients may do with a port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PortCapability: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SYNC_READ = 1 << 2;
        const SYNC_WRITE = 1 << 3;
        const DUPLEX = 1 << 4;
        const SUBS_READ = 1 << 5;
        const SUBS_WRITE = 1 << 6;
        const NO_EXPORT = 1 << 7;
    }
}

impl PortCapability {
    /// Readable and subscribable for reading: an input source for others.
    pub const READABLE: PortCapability = PortCapability::READ.union(PortCapability::SUBS_READ);
    /// Writable and subscribable for writing: an output sink for others.
    pub const WRITABLE: PortCapability = PortCapability::WRITE.union(PortCapability::SUBS_WRITE);
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PortType: u32 {
        const SPECIFIC = 1 << 0;
        const MIDI_GENERIC = 1 << 1;
        const MIDI_GM = 1 << 2;
        const MIDI_GS = 1 << 3;
        const MIDI_XG = 1 << 4;
        const MIDI_MT32 = 1 << 5;
        const MIDI_GM2 = 1 << 6;
        const SYNTH = 1 << 10;
        const DIRECT_SAMPLE = 1 << 11;
        const SAMPLE = 1 << 12;
        const HARDWARE = 1 << 16;
        const SOFTWARE = 1 << 17;
        const SYNTHESIZER = 1 << 18;
        const PORT = 1 << 19;
        const APPLICATION = 1 << 20;
    }
}

/// Receive time stamping of a port's incoming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamping {
    pub queue: QueueId,
    pub real_time: bool,
}

/// A directed connection from `sender`'s output to `dest`'s input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub sender: Address,
    pub dest: Address,
    /// Queue used to stamp delivered events when `time_update` is set.
    pub queue: Option<QueueId>,
    pub exclusive: bool,
    pub time_update: bool,
    pub time_real: bool,
}

impl Subscription {
    pub fn new(sender: Address, dest: Address) -> Self {
        Self {
            sender,
            dest,
            queue: None,
            exclusive: false,
            time_update: false,
            time_real: false,
        }
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn time_update(mut self, queue: QueueId, real_time: bool) -> Self {
        self.queue = Some(queue);
        self.time_update = true;
        self.time_real = real_time;
        self
    }
}

/// Which side of a port a subscriber list describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriberDirection {
    /// Subscriptions reading from the port (port is the sender).
    Read,
    /// Subscriptions writing to the port (port is the destination).
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub client: ClientId,
    /// Assigned by the kernel on creation.
    pub port: Option<PortId>,
    pub name: String,
    pub capability: PortCapability,
    pub port_type: PortType,
    pub midi_channels: u32,
    pub midi_voices: u32,
    pub synth_voices: u32,
    pub timestamping: Option<Timestamping>,
    pub read_subscribers: Vec<Subscription>,
    pub write_subscribers: Vec<Subscription>,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, capability: PortCapability, port_type: PortType) -> Self {
        Self {
            client: 0,
            port: None,
            name: name.into(),
            capability,
            port_type,
            midi_channels: 16,
            midi_voices: 0,
            synth_voices: 0,
            timestamping: None,
            read_subscribers: Vec::new(),
            write_subscribers: Vec::new(),
        }
    }

    /// A readable + writable application MIDI port.
    pub fn duplex(name: impl Into<String>) -> Self {
        Self::new(
            name,
            PortCapability::READABLE | PortCapability::WRITABLE | PortCapability::DUPLEX,
            PortType::MIDI_GENERIC | PortType::APPLICATION,
        )
    }

    pub fn with_timestamping(mut self, queue: QueueId, real_time: bool) -> Self {
        self.timestamping = Some(Timestamping { queue, real_time });
        self
    }

    pub fn with_channels(mut self, midi_channels: u32) -> Self {
        self.midi_channels = midi_channels;
        self
    }

    pub fn address(&self) -> Option<Address> {
        self.port.map(|port| Address::new(self.client, port))
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.port.is_some()
    }

    #[inline]
    pub fn is_exported(&self) -> bool {
        !self.capability.contains(PortCapability::NO_EXPORT)
    }

    /// Other clients can subscribe to read from this port.
    pub fn is_input_source(&self) -> bool {
        self.is_exported() && self.capability.contains(PortCapability::READABLE)
    }

    /// Other clients can subscribe to write to this port.
    pub fn is_output_sink(&self) -> bool {
        self.is_exported() && self.capability.contains(PortCapability::WRITABLE)
    }

    pub fn subscribers(&self, direction: SubscriberDirection) -> &[Subscription] {
        match direction {
            SubscriberDirection::Read => &self.read_subscribers,
            SubscriberDirection::Write => &self.write_subscribers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_port_is_detached() {
        let info = PortInfo::duplex("Out");
        assert!(!info.is_attached());
        assert_eq!(info.address(), None);
        assert!(info.is_input_source());
        assert!(info.is_output_sink());
    }

    #[test]
    fn test_no_export_hides_port() {
        let mut info = PortInfo::new("Hidden", PortCapability::READABLE, PortType::APPLICATION);
        assert!(info.is_input_source());
        info.capability |= PortCapability::NO_EXPORT;
        assert!(!info.is_input_source());
    }

    #[test]
    fn test_write_only_port() {
        let info = PortInfo::new("In", PortCapability::WRITABLE, PortType::MIDI_GENERIC);
        assert!(!info.is_input_source());
        assert!(info.is_output_sink());
    }

    #[test]
    fn test_subscription_builder() {
        let sub = Subscription::new(Address::new(128, 0), Address::new(129, 0))
            .exclusive(true)
            .time_update(2, true);
        assert!(sub.exclusive);
        assert_eq!(sub.queue, Some(2));
        assert!(sub.time_update && sub.time_real);
    }
}
