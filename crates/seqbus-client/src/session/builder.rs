//! ClientSession builder.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{RealtimeConfig, SessionConfig};
use crate::error::Result;
use crate::kernel::SequencerBackend;
use crate::pump::{ElevationChain, RealtimeService};
use crate::router::EventHandler;
use seqbus_event::OpenMode;

use super::ClientSession;

#[derive(Default)]
pub struct SessionBuilder {
    pub(super) config: SessionConfig,
    pub(super) service: Option<Arc<dyn RealtimeService>>,
    pub(super) elevator: Option<ElevationChain>,
    pub(super) handler: Option<Arc<dyn EventHandler>>,
}

impl SessionBuilder {
    /// Replaces every setting with `config`.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = Some(name.into());
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = device.into();
        self
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.config.blocking = blocking;
        self
    }

    pub fn output_timeout(mut self, timeout: Duration) -> Self {
        self.config.output_timeout = Some(timeout);
        self
    }

    pub fn output_buffer_size(mut self, bytes: usize) -> Self {
        self.config.output_buffer_size = Some(bytes);
        self
    }

    pub fn input_buffer_size(mut self, bytes: usize) -> Self {
        self.config.input_buffer_size = Some(bytes);
        self
    }

    pub fn output_pool(mut self, cells: usize) -> Self {
        self.config.pool.output_pool = Some(cells);
        self
    }

    pub fn input_pool(mut self, cells: usize) -> Self {
        self.config.pool.input_pool = Some(cells);
        self
    }

    pub fn output_room(mut self, cells: usize) -> Self {
        self.config.pool.output_room = Some(cells);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn stop_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.config.stop_retries = retries;
        self.config.stop_retry_interval = interval;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    pub fn realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.config.realtime = realtime;
        self
    }

    /// Adds a helper service to the standard elevation chain.
    pub fn realtime_service(mut self, service: Arc<dyn RealtimeService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Replaces the elevation chain entirely.
    pub fn elevator(mut self, chain: ElevationChain) -> Self {
        self.elevator = Some(chain);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Validates the configuration and returns an unopened session.
    pub fn build(self, backend: Arc<dyn SequencerBackend>) -> Result<ClientSession> {
        self.config.validate()?;
        let elevator = self
            .elevator
            .unwrap_or_else(|| ElevationChain::standard(self.service));
        let session = ClientSession::from_parts(self.config, backend, elevator);
        if let Some(handler) = self.handler {
            session.set_handler(handler);
        }
        Ok(session)
    }

    /// Builds and opens with the configured device, mode and blocking flag.
    pub fn open(self, backend: Arc<dyn SequencerBackend>) -> Result<ClientSession> {
        let mut session = self.build(backend)?;
        session.open_default()?;
        Ok(session)
    }
}
