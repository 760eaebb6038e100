//! Ports owned by a session.
//!
//! [`PortRegistry`] tracks the ports a session created. [`Port`] is a
//! borrowed view of one owned port that manages its subscriptions and
//! properties through the session's handle.

use crate::error::{Error, Result};
use crate::kernel::{KernelError, SequencerHandle};
use crate::session::ClientSession;
use seqbus_event::{
    Address, PortCapability, PortInfo, PortType, SequencerEvent, SubscriberDirection,
    Subscription, Timestamping,
};

/// Identifies a port by its kernel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle {
    address: Address,
}

impl PortHandle {
    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }
}

impl From<Address> for PortHandle {
    fn from(address: Address) -> Self {
        Self { address }
    }
}

// ==================== Registry ====================

#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: Vec<PortInfo>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortInfo> {
        self.ports.iter()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.get(address).is_some()
    }

    pub fn get(&self, address: Address) -> Option<&PortInfo> {
        self.ports.iter().find(|p| p.address() == Some(address))
    }

    pub(crate) fn get_mut(&mut self, address: Address) -> Option<&mut PortInfo> {
        self.ports.iter_mut().find(|p| p.address() == Some(address))
    }

    /// Creates `info` in the kernel and records the created port.
    pub fn create(&mut self, handle: &dyn SequencerHandle, info: PortInfo) -> Result<PortHandle> {
        let created = handle.create_port(&info)?;
        let address = created.address().ok_or_else(|| {
            Error::Kernel(KernelError::InvalidArgument(format!(
                "kernel returned port '{}' without an id",
                created.name
            )))
        })?;
        tracing::debug!("Created port {} '{}'", address, created.name);
        self.ports.push(created);
        Ok(PortHandle { address })
    }

    /// Deletes an owned port in the kernel and forgets it. Ports of other
    /// clients are refused before any kernel call.
    pub fn detach(&mut self, handle: &dyn SequencerHandle, port: &PortHandle) -> Result<()> {
        let address = port.address();
        let owner = handle.client_id();
        if address.client != owner {
            return Err(Error::ForeignPort {
                port: address,
                owner: address.client,
            });
        }
        let index = self
            .ports
            .iter()
            .position(|p| p.address() == Some(address))
            .ok_or(Error::UnknownPort(address))?;
        handle.delete_port(address)?;
        self.ports.remove(index);
        tracing::debug!("Detached port {}", address);
        Ok(())
    }

    /// Deletes every owned port, logging and skipping failures.
    pub fn detach_all(&mut self, handle: &dyn SequencerHandle) {
        for info in self.ports.drain(..) {
            let Some(address) = info.address() else {
                continue;
            };
            if let Err(e) = handle.delete_port(address) {
                tracing::warn!("Failed to detach port {}: {}", address, e);
            }
        }
    }
}

// ==================== Port view ====================

pub struct Port<'a> {
    session: &'a mut ClientSession,
    address: Address,
}

impl<'a> Port<'a> {
    pub(crate) fn new(session: &'a mut ClientSession, address: Address) -> Self {
        Self { session, address }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn handle(&self) -> PortHandle {
        PortHandle::from(self.address)
    }

    // ==================== Subscriptions ====================

    /// Connects this port's output to `dest`.
    pub fn subscribe_to(&mut self, dest: Address) -> Result<()> {
        self.subscribe(Subscription::new(self.address, dest))
    }

    pub fn subscribe_to_name(&mut self, dest: &str) -> Result<()> {
        let dest = self.session.resolve_address(dest)?;
        self.subscribe_to(dest)
    }

    /// Connects `sender`'s output to this port.
    pub fn subscribe_from(&mut self, sender: Address) -> Result<()> {
        self.subscribe(Subscription::new(sender, self.address))
    }

    pub fn subscribe_from_name(&mut self, sender: &str) -> Result<()> {
        let sender = self.session.resolve_address(sender)?;
        self.subscribe_from(sender)
    }

    /// Receives client, port and subscription announcements on this port.
    pub fn subscribe_from_announce(&mut self) -> Result<()> {
        self.subscribe_from(Address::SYSTEM_ANNOUNCE)
    }

    /// Subscribes with explicit options.
    pub fn subscribe(&mut self, subscription: Subscription) -> Result<()> {
        let handle = self.session.kernel()?;
        handle.subscribe(&subscription)?;
        tracing::debug!(
            "Subscribed {} -> {}",
            subscription.sender,
            subscription.dest
        );
        Ok(())
    }

    /// A missing subscription is not an error.
    pub fn unsubscribe_to(&mut self, dest: Address) -> Result<()> {
        self.unsubscribe(self.address, dest)
    }

    pub fn unsubscribe_from(&mut self, sender: Address) -> Result<()> {
        self.unsubscribe(sender, self.address)
    }

    fn unsubscribe(&mut self, sender: Address, dest: Address) -> Result<()> {
        let handle = self.session.kernel()?;
        match handle.unsubscribe(sender, dest) {
            Ok(()) | Err(KernelError::NotSubscribed { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every subscription in both directions. Failures are logged
    /// and skipped.
    pub fn unsubscribe_all(&mut self) -> Result<()> {
        let handle = self.session.kernel()?;
        let mut subscriptions = handle.query_subscribers(self.address, SubscriberDirection::Read)?;
        subscriptions.extend(handle.query_subscribers(self.address, SubscriberDirection::Write)?);
        for sub in subscriptions {
            match handle.unsubscribe(sub.sender, sub.dest) {
                Ok(()) | Err(KernelError::NotSubscribed { .. }) => {}
                Err(e) => tracing::warn!("Failed to unsubscribe {} -> {}: {}", sub.sender, sub.dest, e),
            }
        }
        Ok(())
    }

    /// Makes the set of destinations this port writes to equal `desired`.
    pub fn update_connections_to(&mut self, desired: &[Address]) -> Result<()> {
        let current: Vec<Address> = self.read_subscribers()?.iter().map(|s| s.dest).collect();
        for dest in current.iter().filter(|d| !desired.contains(d)) {
            self.unsubscribe_to(*dest)?;
        }
        for dest in dedup(desired).filter(|d| !current.contains(d)) {
            self.subscribe_to(dest)?;
        }
        Ok(())
    }

    /// Makes the set of senders writing to this port equal `desired`.
    pub fn update_connections_from(&mut self, desired: &[Address]) -> Result<()> {
        let current: Vec<Address> = self.write_subscribers()?.iter().map(|s| s.sender).collect();
        for sender in current.iter().filter(|s| !desired.contains(s)) {
            self.unsubscribe_from(*sender)?;
        }
        for sender in dedup(desired).filter(|s| !current.contains(s)) {
            self.subscribe_from(sender)?;
        }
        Ok(())
    }

    /// Subscriptions reading from this port.
    pub fn read_subscribers(&self) -> Result<Vec<Subscription>> {
        let handle = self.session.kernel()?;
        Ok(handle.query_subscribers(self.address, SubscriberDirection::Read)?)
    }

    /// Subscriptions writing to this port.
    pub fn write_subscribers(&self) -> Result<Vec<Subscription>> {
        let handle = self.session.kernel()?;
        Ok(handle.query_subscribers(self.address, SubscriberDirection::Write)?)
    }

    // ==================== Properties ====================

    /// The session's cached record of this port.
    pub fn info(&self) -> Result<PortInfo> {
        self.session
            .ports
            .get(self.address)
            .cloned()
            .ok_or(Error::UnknownPort(self.address))
    }

    /// Re-reads the port, subscriber lists included, from the kernel.
    pub fn refresh(&mut self) -> Result<PortInfo> {
        let handle = self.session.kernel()?;
        let info = handle.port_info(self.address)?;
        if let Some(cached) = self.session.ports.get_mut(self.address) {
            *cached = info.clone();
        }
        Ok(info)
    }

    fn update(&mut self, what: &str, f: impl FnOnce(&mut PortInfo)) -> Result<()> {
        let handle = self.session.kernel()?;
        let info = self
            .session
            .ports
            .get_mut(self.address)
            .ok_or(Error::UnknownPort(self.address))?;
        f(info);
        handle.set_port_info(info).map_err(|e| {
            tracing::warn!("Cannot set {} of port {}: {}", what, self.address, e);
            Error::from(e)
        })
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.update("name", |p| p.name = name.to_string())
    }

    pub fn set_capability(&mut self, capability: PortCapability) -> Result<()> {
        self.update("capability", |p| p.capability = capability)
    }

    pub fn set_port_type(&mut self, port_type: PortType) -> Result<()> {
        self.update("type", |p| p.port_type = port_type)
    }

    pub fn set_midi_channels(&mut self, channels: u32) -> Result<()> {
        self.update("channels", |p| p.midi_channels = channels)
    }

    pub fn set_midi_voices(&mut self, voices: u32) -> Result<()> {
        self.update("midi voices", |p| p.midi_voices = voices)
    }

    pub fn set_synth_voices(&mut self, voices: u32) -> Result<()> {
        self.update("synth voices", |p| p.synth_voices = voices)
    }

    /// Stamps incoming events with the time of `queue`; `None` disables it.
    pub fn set_timestamping(&mut self, timestamping: Option<Timestamping>) -> Result<()> {
        self.update("timestamping", |p| p.timestamping = timestamping)
    }

    // ==================== Output ====================

    /// Sends `event` from this port through the session's output buffer.
    pub fn send(&mut self, event: SequencerEvent) -> Result<()> {
        self.session.send(&event.with_source(self.address))
    }

    pub fn send_direct(&mut self, event: SequencerEvent) -> Result<()> {
        self.session.send_direct(&event.with_source(self.address))
    }
}

fn dedup(addresses: &[Address]) -> impl Iterator<Item = Address> + '_ {
    addresses
        .iter()
        .enumerate()
        .filter(move |(i, a)| !addresses[..*i].contains(a))
        .map(|(_, a)| *a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::kernel::VirtualSequencer;
    use std::sync::Arc;

    fn session(bus: &VirtualSequencer) -> ClientSession {
        ClientSession::builder()
            .realtime(RealtimeConfig::disabled())
            .open(Arc::new(bus.clone()))
            .unwrap()
    }

    #[test]
    fn test_create_assigns_address() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        let port = s.create_port(PortInfo::duplex("out")).unwrap();
        assert_eq!(Some(port.address().client), s.client_id());
        assert_eq!(s.ports().count(), 1);
        assert_eq!(
            s.port(&port).unwrap().info().unwrap().address(),
            Some(port.address())
        );
    }

    #[test]
    fn test_foreign_detach_refused() {
        let bus = VirtualSequencer::new();
        let mut a = session(&bus);
        let mut b = session(&bus);
        let foreign = b.create_port(PortInfo::duplex("theirs")).unwrap();

        let result = a.detach_port(&foreign);
        assert!(matches!(result, Err(Error::ForeignPort { .. })));
        assert!(b.handle().unwrap().port_info(foreign.address()).is_ok());
        assert!(matches!(a.port(&foreign), Err(Error::UnknownPort(_))));
    }

    #[test]
    fn test_detach_own_port() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        let port = s.create_port(PortInfo::duplex("p")).unwrap();
        s.detach_port(&port).unwrap();
        assert_eq!(s.ports().count(), 0);
        assert!(matches!(s.detach_port(&port), Err(Error::UnknownPort(_))));
        assert!(s.handle().unwrap().port_info(port.address()).is_err());
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = VirtualSequencer::new();
        let mut a = session(&bus);
        let mut b = session(&bus);
        let out = a.create_port(PortInfo::duplex("out")).unwrap();
        let sink = b.create_port(PortInfo::duplex("in")).unwrap();

        let mut port = a.port(&out).unwrap();
        port.subscribe_to(sink.address()).unwrap();
        let subs = port.read_subscribers().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].dest, sink.address());

        port.unsubscribe_to(sink.address()).unwrap();
        port.unsubscribe_to(sink.address()).unwrap();
        assert!(port.read_subscribers().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_by_name() {
        let bus = VirtualSequencer::new();
        let mut a = session(&bus);
        let mut b = session(&bus);
        b.set_client_name("Synth Box").unwrap();
        let sink = b.create_port(PortInfo::duplex("in")).unwrap();
        let out = a.create_port(PortInfo::duplex("out")).unwrap();

        let mut port = a.port(&out).unwrap();
        port.subscribe_to_name("synth box:0").unwrap();
        assert_eq!(port.read_subscribers().unwrap()[0].dest, sink.address());
        assert!(matches!(
            port.subscribe_to_name("missing:0"),
            Err(Error::Address(_))
        ));
    }

    #[test]
    fn test_update_connections_is_idempotent() {
        let bus = VirtualSequencer::new();
        let mut a = session(&bus);
        let mut b = session(&bus);
        let out = a.create_port(PortInfo::duplex("out")).unwrap();
        let x = b.create_port(PortInfo::duplex("x")).unwrap().address();
        let y = b.create_port(PortInfo::duplex("y")).unwrap().address();
        let z = b.create_port(PortInfo::duplex("z")).unwrap().address();

        let mut port = a.port(&out).unwrap();
        port.update_connections_to(&[x, y]).unwrap();
        port.update_connections_to(&[x, y, y]).unwrap();
        let mut dests: Vec<_> = port.read_subscribers().unwrap().iter().map(|s| s.dest).collect();
        dests.sort();
        assert_eq!(dests, vec![x, y]);

        port.update_connections_to(&[y, z]).unwrap();
        let mut dests: Vec<_> = port.read_subscribers().unwrap().iter().map(|s| s.dest).collect();
        dests.sort();
        assert_eq!(dests, vec![y, z]);
    }

    #[test]
    fn test_update_connections_from() {
        let bus = VirtualSequencer::new();
        let mut a = session(&bus);
        let mut b = session(&bus);
        let sink = a.create_port(PortInfo::duplex("in")).unwrap();
        let x = b.create_port(PortInfo::duplex("x")).unwrap().address();

        let mut port = a.port(&sink).unwrap();
        port.update_connections_from(&[x]).unwrap();
        assert_eq!(port.write_subscribers().unwrap()[0].sender, x);
        port.update_connections_from(&[]).unwrap();
        assert!(port.write_subscribers().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_all() {
        let bus = VirtualSequencer::new();
        let mut a = session(&bus);
        let mut b = session(&bus);
        let p = a.create_port(PortInfo::duplex("p")).unwrap();
        let x = b.create_port(PortInfo::duplex("x")).unwrap().address();

        let mut port = a.port(&p).unwrap();
        port.subscribe_to(x).unwrap();
        port.subscribe_from(x).unwrap();
        port.subscribe_from_announce().unwrap();
        port.unsubscribe_all().unwrap();
        assert!(port.read_subscribers().unwrap().is_empty());
        assert!(port.write_subscribers().unwrap().is_empty());
    }

    #[test]
    fn test_property_setters_reach_kernel() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        let q = s.create_queue("stamp").unwrap();
        let p = s.create_port(PortInfo::duplex("before")).unwrap();

        let mut port = s.port(&p).unwrap();
        port.set_name("after").unwrap();
        port.set_midi_channels(4).unwrap();
        port.set_port_type(PortType::SYNTHESIZER).unwrap();
        port.set_timestamping(Some(Timestamping {
            queue: q,
            real_time: true,
        }))
        .unwrap();

        let info = port.refresh().unwrap();
        assert_eq!(info.name, "after");
        assert_eq!(info.midi_channels, 4);
        assert_eq!(info.port_type, PortType::SYNTHESIZER);
        assert_eq!(info.timestamping.map(|t| t.queue), Some(q));
        assert_eq!(port.info().unwrap(), info);
    }

    #[test]
    fn test_port_send_sets_source() {
        let bus = VirtualSequencer::new();
        let mut a = session(&bus);
        let mut b = session(&bus);
        let out = a.create_port(PortInfo::duplex("out")).unwrap();
        let sink = b.create_port(PortInfo::duplex("in")).unwrap();

        let mut port = a.port(&out).unwrap();
        port.send(SequencerEvent::note_on(0, 60, 100).to(sink.address()))
            .unwrap();
        a.drain_output().unwrap();

        let record = b.handle().unwrap().read().unwrap().unwrap();
        let event = crate::codec::decode(&record).unwrap();
        assert_eq!(event.source, out.address());
    }
}
