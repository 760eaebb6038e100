//! Error types for the sequencer client.

use crate::kernel::KernelError;
use seqbus_event::{Address, AddressError, QueueId};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Session is not open")]
    NotOpen,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Output buffer full ({capacity} bytes)")]
    OutputBufferFull { capacity: usize },

    #[error("No queue named '{0}'")]
    QueueNotFound(String),

    #[error("Session has no queue")]
    NoQueue,

    #[error("Port {port} belongs to client {owner}, not this session")]
    ForeignPort { port: Address, owner: u8 },

    #[error("Port {0} is not owned by this session")]
    UnknownPort(Address),

    #[error("Cannot decode record: {0}")]
    Decode(#[from] DecodeError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Queue {0} is not accessible")]
    QueueUnavailable(QueueId),

    #[error("Failed to spawn input thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Raw record that does not carry a valid event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("kind {0} requires an extension payload")]
    MissingExtension(u8),

    #[error("text payload is not valid UTF-8")]
    InvalidText,
}

pub type Result<T> = std::result::Result<T, Error>;
