//! Cached view of the clients and ports on the bus.

use crate::kernel::{KernelResult, SequencerHandle};
use seqbus_event::address::SYSTEM_CLIENT;
use seqbus_event::{ClientId, ClientInfo, PortInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct Directory {
    /// Set by the input pump on client and port announcements.
    dirty: Arc<AtomicBool>,
    clients: Vec<ClientInfo>,
    ports: Vec<PortInfo>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            dirty: Arc::new(AtomicBool::new(true)),
            clients: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn dirty_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dirty)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Reloads from the kernel if anything changed since the last load.
    pub fn refresh(&mut self, handle: &dyn SequencerHandle) -> KernelResult<()> {
        // Cleared before loading so announcements arriving meanwhile are kept.
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.load(handle) {
            self.mark_dirty();
            return Err(e);
        }
        Ok(())
    }

    fn load(&mut self, handle: &dyn SequencerHandle) -> KernelResult<()> {
        let mut clients = Vec::new();
        let mut ports = Vec::new();
        let mut after = None;
        while let Some(client) = handle.next_client(after)? {
            after = Some(client.client);
            let mut port_after = None;
            while let Some(port) = handle.next_port(client.client, port_after)? {
                port_after = port.port;
                if port_after.is_none() {
                    break;
                }
                ports.push(port);
            }
            clients.push(client);
        }
        tracing::debug!(
            "Directory reloaded: {} clients, {} ports",
            clients.len(),
            ports.len()
        );
        self.clients = clients;
        self.ports = ports;
        Ok(())
    }

    pub fn clients(&self) -> &[ClientInfo] {
        &self.clients
    }

    /// Ports of other user clients that accept read subscriptions.
    pub fn inputs(&self, own: Option<ClientId>) -> Vec<PortInfo> {
        self.foreign_ports(own)
            .filter(|p| p.is_input_source())
            .cloned()
            .collect()
    }

    /// Ports of other user clients that accept write subscriptions.
    pub fn outputs(&self, own: Option<ClientId>) -> Vec<PortInfo> {
        self.foreign_ports(own)
            .filter(|p| p.is_output_sink())
            .cloned()
            .collect()
    }

    fn foreign_ports(&self, own: Option<ClientId>) -> impl Iterator<Item = &PortInfo> {
        self.ports
            .iter()
            .filter(move |p| p.client != SYSTEM_CLIENT && Some(p.client) != own)
    }

    /// Case-insensitive client name lookup.
    pub fn find_client(&self, name: &str) -> Option<ClientId> {
        let wanted = name.to_lowercase();
        self.clients
            .iter()
            .find(|c| c.name.to_lowercase() == wanted)
            .map(|c| c.client)
    }

    pub fn clear(&mut self) {
        self.clients.clear();
        self.ports.clear();
        self.mark_dirty();
    }
}
