//! Event model for the seqbus sequencer client.
//!
//! Pure data types shared by the session layer and the kernel boundary:
//! addresses, events with their scheduling envelope, port/client records,
//! queue records with tempo math, and event removal criteria.
//!
//! # Example
//!
//! ```ignore
//! use seqbus_event::{Address, SequencerEvent};
//!
//! let event = SequencerEvent::note_on(0, 60, 100)
//!     .with_source(Address::new(128, 0))
//!     .to_subscribers()
//!     .at_tick(0, 480);
//! assert!(event.is_channel());
//! ```

pub mod address;
pub use address::{Address, AddressError, ClientId, Destination, PortId};

pub mod time;
pub use time::{RealTime, Schedule, Timestamp};

pub mod kind;

pub mod event;
pub use event::{EventData, Notice, Priority, SequencerEvent, SystemKind, ValueKind};

pub mod port;
pub use port::{PortCapability, PortInfo, PortType, SubscriberDirection, Subscription, Timestamping};

pub mod client;
pub use client::{ClientInfo, ClientType, OpenMode, PoolInfo};

pub mod queue;
pub use queue::{
    QueueControl, QueueId, QueueInfo, QueueStatus, QueueTempo, QueueTimer, TimerSource,
    DEFAULT_PPQ, DEFAULT_TEMPO_USEC, SKEW_BASE,
};

pub mod filter;
pub use filter::RemoveCriteria;
