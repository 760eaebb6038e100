//! Client/port addressing on the sequencer bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type ClientId = u8;
pub type PortId = u8;

/// The kernel's own client.
pub const SYSTEM_CLIENT: ClientId = 0;
/// Port of the system client that accepts queue control events.
pub const SYSTEM_TIMER_PORT: PortId = 0;
/// Port of the system client that announces client/port/subscription changes.
pub const SYSTEM_ANNOUNCE_PORT: PortId = 1;
/// First id handed out to user clients.
pub const FIRST_USER_CLIENT: ClientId = 128;
/// Wire marker for "deliver to every subscriber of the source port".
pub const ADDRESS_SUBSCRIBERS: ClientId = 254;
/// Wire marker for "deliver to every client".
pub const ADDRESS_BROADCAST: ClientId = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("invalid client '{0}'")]
    InvalidClient(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("no client named '{0}'")]
    ClientNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address {
    pub client: ClientId,
    pub port: PortId,
}

impl Address {
    pub const SYSTEM_TIMER: Address = Address::new(SYSTEM_CLIENT, SYSTEM_TIMER_PORT);
    pub const SYSTEM_ANNOUNCE: Address = Address::new(SYSTEM_CLIENT, SYSTEM_ANNOUNCE_PORT);

    #[inline]
    pub const fn new(client: ClientId, port: PortId) -> Self {
        Self { client, port }
    }

    /// Splits `text` at its last colon into a client part and an optional
    /// numeric port. The client part is returned verbatim so callers can
    /// resolve it as a name when it is not numeric.
    pub fn split(text: &str) -> Result<(&str, PortId), AddressError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AddressError::Empty);
        }
        match text.rsplit_once(':') {
            Some((client, port)) => {
                let client = client.trim();
                if client.is_empty() {
                    return Err(AddressError::Empty);
                }
                let port = port
                    .trim()
                    .parse::<PortId>()
                    .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
                Ok((client, port))
            }
            None => Ok((text, 0)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.port)
    }
}

/// Numeric form only (`"128:0"`, `"20"`). Name lookup needs a client
/// directory and lives in the session layer.
impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (client, port) = Address::split(s)?;
        let client = client
            .parse::<ClientId>()
            .map_err(|_| AddressError::InvalidClient(client.to_string()))?;
        Ok(Address::new(client, port))
    }
}

impl From<(ClientId, PortId)> for Address {
    fn from((client, port): (ClientId, PortId)) -> Self {
        Address::new(client, port)
    }
}

/// Where an outgoing event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Destination {
    /// Every port subscribed to the source port.
    #[default]
    Subscribers,
    /// Every client accepting broadcasts.
    Broadcast,
    Address(Address),
}

impl Destination {
    pub fn address(&self) -> Option<Address> {
        match self {
            Destination::Address(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        Destination::Address(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric() {
        assert_eq!("128:3".parse::<Address>().unwrap(), Address::new(128, 3));
        assert_eq!(" 20 ".parse::<Address>().unwrap(), Address::new(20, 0));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Address>(), Err(AddressError::Empty));
        assert_eq!(":1".parse::<Address>(), Err(AddressError::Empty));
        assert!(matches!(
            "128:x".parse::<Address>(),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            "Synth:0".parse::<Address>(),
            Err(AddressError::InvalidClient(_))
        ));
        assert!(matches!(
            "999:0".parse::<Address>(),
            Err(AddressError::InvalidClient(_))
        ));
    }

    #[test]
    fn test_split_keeps_colons_in_names() {
        let (client, port) = Address::split("Midi Through: Port:1").unwrap();
        assert_eq!(client, "Midi Through: Port");
        assert_eq!(port, 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::new(130, 2).to_string(), "130:2");
        assert_eq!(Address::SYSTEM_ANNOUNCE.to_string(), "0:1");
    }
}
