//! Client library for the kernel sequencer bus.
//!
//! A [`ClientSession`] opens a kernel client, owns its ports and at most
//! one scheduling queue, buffers outgoing events and runs a background
//! input pump that routes incoming events through one of three delivery
//! strategies.
//!
//! The kernel sits behind [`SequencerBackend`]/[`SequencerHandle`];
//! [`VirtualSequencer`] is an in-process implementation.
//!
//! # Example
//!
//! ```ignore
//! use seqbus_client::{ClientSession, VirtualSequencer};
//! use seqbus_event::{PortInfo, SequencerEvent};
//! use std::sync::Arc;
//!
//! let mut session = ClientSession::builder()
//!     .client_name("player")
//!     .open(Arc::new(VirtualSequencer::new()))?;
//! let port = session.create_port(PortInfo::duplex("out"))?;
//! let queue = session.create_queue("tempo")?;
//! session.queue()?.set_nominal_bpm(120.0)?;
//! session.queue()?.start()?;
//! session.port(&port)?.send(SequencerEvent::note_on(0, 60, 100).at_tick(queue, 96))?;
//! session.drain_output()?;
//! ```

pub mod error;
pub use error::{DecodeError, Error, Result};

pub mod config;
pub use config::{PoolConfig, RealtimeConfig, SessionConfig};

pub mod kernel;
pub use kernel::{
    KernelError, KernelResult, RawRecord, SequencerBackend, SequencerHandle, VirtualSequencer,
};

pub mod codec;

pub mod router;
pub use router::{Delivery, DeliveryStrategy, EventHandler, EventListener, EventRouter, ListenerId};

pub mod output;
pub use output::OutputChannel;

pub mod pump;
pub use pump::{
    DegradeElevator, DirectElevator, ElevationChain, EventPump, PriorityElevator, PumpConfig,
    PumpState, RealtimeService, ServiceElevator, ServiceError,
};

pub mod port;
pub use port::{Port, PortHandle, PortRegistry};

pub mod queue;
pub use queue::{QueueBinding, QueueScheduler};

mod session;
pub use session::{ClientSession, SessionBuilder};
