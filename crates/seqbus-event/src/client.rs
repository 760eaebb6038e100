//! Client identity and kernel pool records.

use crate::address::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OpenMode {
    Input,
    Output,
    #[default]
    Duplex,
}

impl OpenMode {
    #[inline]
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Input | OpenMode::Duplex)
    }

    #[inline]
    pub fn can_write(self) -> bool {
        matches!(self, OpenMode::Output | OpenMode::Duplex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClientType {
    #[default]
    User,
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client: ClientId,
    pub name: String,
    pub client_type: ClientType,
    /// Accept events sent to the broadcast address.
    pub broadcast_filter: bool,
    /// Bounce undeliverable events back to the sender.
    pub error_bounce: bool,
    /// When non-empty, only these event kinds are delivered to the client.
    pub event_filter: BTreeSet<u8>,
    pub num_ports: usize,
    pub events_lost: usize,
}

impl ClientInfo {
    pub fn new(client: ClientId, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether an event of `kind` passes this client's event filter.
    pub fn accepts(&self, kind: u8) -> bool {
        self.event_filter.is_empty() || self.event_filter.contains(&kind)
    }
}

pub const DEFAULT_OUTPUT_POOL: usize = 500;
pub const DEFAULT_INPUT_POOL: usize = 200;
pub const DEFAULT_OUTPUT_ROOM: usize = 1;

/// Kernel-side event cells reserved for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub client: ClientId,
    pub output_pool: usize,
    pub input_pool: usize,
    /// Free output cells required before the client is reported writable.
    pub output_room: usize,
    pub output_free: usize,
    pub input_free: usize,
}

impl Default for PoolInfo {
    fn default() -> Self {
        Self {
            client: 0,
            output_pool: DEFAULT_OUTPUT_POOL,
            input_pool: DEFAULT_INPUT_POOL,
            output_room: DEFAULT_OUTPUT_ROOM,
            output_free: DEFAULT_OUTPUT_POOL,
            input_free: DEFAULT_INPUT_POOL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_directions() {
        assert!(OpenMode::Duplex.can_read() && OpenMode::Duplex.can_write());
        assert!(OpenMode::Input.can_read() && !OpenMode::Input.can_write());
        assert!(!OpenMode::Output.can_read() && OpenMode::Output.can_write());
    }

    #[test]
    fn test_event_filter() {
        let mut info = ClientInfo::new(128, "T1");
        assert!(info.accepts(6));
        info.event_filter.insert(10);
        assert!(!info.accepts(6));
        assert!(info.accepts(10));
    }
}
