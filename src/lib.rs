//! # seqbus - Kernel sequencer bus client
//!
//! Client library for a kernel-resident MIDI sequencer.
//!
//! ## Architecture
//!
//! seqbus is an umbrella crate over:
//! - **seqbus-event** - Event model (addresses, events, port/client/queue records)
//! - **seqbus-client** - Sessions, ports, queues, buffered output, input pump and routing
//!
//! ## Quick Start
//!
//! ```ignore
//! use seqbus::prelude::*;
//! use std::sync::Arc;
//!
//! let mut session = ClientSession::builder()
//!     .client_name("player")
//!     .open(Arc::new(VirtualSequencer::new()))?;
//!
//! let out = session.create_port(PortInfo::duplex("out"))?;
//! let target = session.resolve_address("synth:0")?;
//! session.port(&out)?.subscribe_to(target)?;
//!
//! session.create_queue("tempo")?;
//! session.queue()?.set_nominal_bpm(120.0)?;
//! session.queue()?.start()?;
//! ```

/// Re-export of seqbus-event for direct access
pub use seqbus_event as event;

/// Re-export of seqbus-client for direct access
pub use seqbus_client as client;

pub use seqbus_event::{
    Address, AddressError, ClientId, ClientInfo, Destination, EventData, OpenMode, PoolInfo,
    PortCapability, PortId, PortInfo, PortType, QueueControl, QueueId, QueueInfo, QueueStatus,
    QueueTempo, QueueTimer, RealTime, RemoveCriteria, Schedule, SequencerEvent, Subscription,
    TimerSource,
};

pub use seqbus_client::{
    ClientSession, Delivery, ElevationChain, EventHandler, EventListener, EventRouter,
    KernelError, ListenerId, Port, PortHandle, PumpState, QueueBinding, QueueScheduler,
    RealtimeConfig, RealtimeService, SequencerBackend, SequencerHandle, SessionBuilder,
    SessionConfig, VirtualSequencer,
};

mod error;
pub use error::{Error, Result};

/// Convenience prelude for common imports
pub mod prelude {
    // Session
    pub use crate::{ClientSession, SessionBuilder, SessionConfig, VirtualSequencer};

    // Essential types
    pub use crate::{Address, PortInfo, SequencerEvent};

    // Views
    pub use crate::{Port, PortHandle, QueueScheduler};

    // Delivery
    pub use crate::{EventHandler, EventListener};

    pub use crate::{Error, Result};
}
