//! The sequencer client session.
//!
//! A [`ClientSession`] owns the kernel handle and everything tied to it:
//! ports, at most one queue binding, the local output buffer and the input
//! pump. Closing tears these down in a fixed order: pump, ports, queue,
//! handle.

mod builder;
pub use builder::SessionBuilder;

mod directory;
use directory::Directory;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::kernel::{KernelError, KernelResult, SequencerBackend, SequencerHandle};
use crate::output::OutputChannel;
use crate::port::{Port, PortHandle, PortRegistry};
use crate::pump::{ElevationChain, EventPump, PumpConfig, PumpState};
use crate::queue::{QueueBinding, QueueScheduler};
use crate::router::{EventHandler, EventListener, EventRouter, ListenerId};
use crossbeam_channel::Receiver;
use seqbus_event::{
    Address, AddressError, ClientId, ClientInfo, OpenMode, PoolInfo, PortInfo, QueueId,
    QueueInfo, RemoveCriteria, SequencerEvent,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Interval between pool checks while synchronizing output.
const SYNC_POLL: Duration = Duration::from_millis(5);

pub struct ClientSession {
    pub(crate) config: SessionConfig,
    backend: Arc<dyn SequencerBackend>,
    handle: Option<Arc<dyn SequencerHandle>>,
    info: ClientInfo,
    pub(crate) ports: PortRegistry,
    pub(crate) queue: QueueBinding,
    pub(crate) output: OutputChannel,
    router: Arc<EventRouter>,
    pump: Option<EventPump>,
    directory: Directory,
    elevator: ElevationChain,
}

impl ClientSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// An unopened session with the default configuration.
    pub fn new(backend: Arc<dyn SequencerBackend>) -> Self {
        Self::from_parts(SessionConfig::default(), backend, ElevationChain::default())
    }

    pub(crate) fn from_parts(
        config: SessionConfig,
        backend: Arc<dyn SequencerBackend>,
        elevator: ElevationChain,
    ) -> Self {
        let router = Arc::new(EventRouter::new(config.event_queue_capacity));
        Self {
            config,
            backend,
            handle: None,
            info: ClientInfo::default(),
            ports: PortRegistry::new(),
            queue: QueueBinding::Unbound,
            output: OutputChannel::new(),
            router,
            pump: None,
            directory: Directory::new(),
            elevator,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ==================== Lifecycle ====================

    /// Opens the session. Opening an open session does nothing.
    pub fn open(&mut self, device: &str, mode: OpenMode, blocking: bool) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.backend.open(device, mode, blocking)?;
        let client = handle.client_id();
        self.info = handle
            .client_info(client)
            .unwrap_or_else(|_| ClientInfo::new(client, String::new()));
        self.config.device = device.to_string();
        self.config.mode = mode;
        self.config.blocking = blocking;
        self.handle = Some(handle);
        self.directory.mark_dirty();
        tracing::debug!("Session opened on '{}' as client {}", device, client);

        if let Some(name) = self.config.client_name.clone() {
            let _ = self.set_client_name(&name);
        }
        self.apply_buffer_config();
        Ok(())
    }

    /// Opens with the configured device, mode and blocking flag.
    pub fn open_default(&mut self) -> Result<()> {
        let device = self.config.device.clone();
        self.open(&device, self.config.mode, self.config.blocking)
    }

    fn apply_buffer_config(&mut self) {
        if let Some(bytes) = self.config.output_buffer_size {
            let _ = self.set_output_buffer_size(bytes);
        }
        if let Some(bytes) = self.config.input_buffer_size {
            let _ = self.set_input_buffer_size(bytes);
        }
        let pool = self.config.pool;
        if !pool.is_empty() {
            let mut info = self.pool_info();
            info.output_pool = pool.output_pool.unwrap_or(info.output_pool);
            info.input_pool = pool.input_pool.unwrap_or(info.input_pool);
            info.output_room = pool.output_room.unwrap_or(info.output_room);
            let _ = self.set_pool_info(&info);
        }
    }

    /// Stops input, detaches ports, releases an owned queue and closes the
    /// handle. Closing a closed session does nothing.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        self.stop_input();
        self.pump = None;

        self.ports.detach_all(&*handle);
        if let QueueBinding::Owned(queue) = self.queue {
            if let Err(e) = handle.free_queue(queue) {
                tracing::warn!("Failed to free queue {}: {}", queue, e);
            }
        }
        self.queue = QueueBinding::Unbound;
        self.output.clear();

        handle.close();
        self.handle = None;
        self.directory.clear();
        tracing::debug!("Session for client {} closed", self.info.client);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.handle.as_ref().map(|h| h.client_id())
    }

    /// The raw kernel handle, for operations the session does not wrap.
    pub fn handle(&self) -> Option<Arc<dyn SequencerHandle>> {
        self.handle.clone()
    }

    pub(crate) fn kernel(&self) -> Result<Arc<dyn SequencerHandle>> {
        self.handle.clone().ok_or(Error::NotOpen)
    }

    pub fn device_name(&self) -> &str {
        &self.config.device
    }

    pub fn open_mode(&self) -> OpenMode {
        self.config.mode
    }

    pub fn is_blocking(&self) -> bool {
        self.config.blocking
    }

    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        if let Some(handle) = &self.handle {
            handle.set_blocking(blocking)?;
        }
        self.config.blocking = blocking;
        Ok(())
    }

    // ==================== Identity ====================

    /// Fresh client record from the kernel.
    pub fn client_info(&self) -> Result<ClientInfo> {
        let handle = self.kernel()?;
        Ok(handle.client_info(handle.client_id())?)
    }

    fn refreshed_info(&mut self, what: &str) -> Option<&ClientInfo> {
        match self.client_info() {
            Ok(info) => {
                self.info = info;
                Some(&self.info)
            }
            Err(e) => {
                tracing::warn!("Cannot read client {}: {}", what, e);
                None
            }
        }
    }

    /// Applies `f` to a copy of the identity and keeps it only once the
    /// kernel has accepted it.
    fn update_info(&mut self, what: &str, f: impl FnOnce(&mut ClientInfo)) -> Result<()> {
        let handle = self.kernel()?;
        let mut info = self.info.clone();
        f(&mut info);
        handle.set_client_info(&info).map_err(|e| {
            tracing::warn!("Cannot set client {}: {}", what, e);
            Error::from(e)
        })?;
        self.info = info;
        Ok(())
    }

    /// Renames the client. Before open the name is kept for the next open.
    pub fn set_client_name(&mut self, name: &str) -> Result<()> {
        if !self.is_open() {
            self.config.client_name = Some(name.to_string());
            return Ok(());
        }
        self.update_info("name", |info| info.name = name.to_string())?;
        self.config.client_name = Some(name.to_string());
        Ok(())
    }

    pub fn client_name(&mut self) -> String {
        self.refreshed_info("name")
            .map(|info| info.name.clone())
            .unwrap_or_default()
    }

    pub fn set_broadcast_filter(&mut self, enabled: bool) -> Result<()> {
        self.update_info("broadcast filter", |info| info.broadcast_filter = enabled)
    }

    pub fn broadcast_filter(&mut self) -> bool {
        self.refreshed_info("broadcast filter")
            .is_some_and(|info| info.broadcast_filter)
    }

    pub fn set_error_bounce(&mut self, enabled: bool) -> Result<()> {
        self.update_info("error bounce", |info| info.error_bounce = enabled)
    }

    pub fn error_bounce(&mut self) -> bool {
        self.refreshed_info("error bounce")
            .is_some_and(|info| info.error_bounce)
    }

    /// Restricts delivery to the client to the filtered event kinds.
    pub fn add_event_filter(&mut self, kind: u8) -> Result<()> {
        self.update_info("event filter", |info| {
            info.event_filter.insert(kind);
        })
    }

    pub fn clear_event_filter(&mut self) -> Result<()> {
        self.update_info("event filter", |info| info.event_filter.clear())
    }

    pub fn event_filter(&mut self) -> BTreeSet<u8> {
        self.refreshed_info("event filter")
            .map(|info| info.event_filter.clone())
            .unwrap_or_default()
    }

    // ==================== Directory ====================

    fn refresh_directory(&mut self) {
        // Without the pump nothing reports changes, so always reload.
        if !self.is_input_running() {
            self.directory.mark_dirty();
        }
        let Some(handle) = self.handle.clone() else {
            return;
        };
        if let Err(e) = self.directory.refresh(&*handle) {
            tracing::warn!("Cannot list clients: {}", e);
        }
    }

    pub fn available_clients(&mut self) -> Vec<ClientInfo> {
        self.refresh_directory();
        self.directory.clients().to_vec()
    }

    /// Foreign ports this session can subscribe to read from.
    pub fn available_inputs(&mut self) -> Vec<PortInfo> {
        self.refresh_directory();
        self.directory.inputs(self.client_id())
    }

    /// Foreign ports this session can subscribe to write to.
    pub fn available_outputs(&mut self) -> Vec<PortInfo> {
        self.refresh_directory();
        self.directory.outputs(self.client_id())
    }

    /// Whether client or port announcements arrived since the last listing.
    pub fn directory_changed(&self) -> bool {
        self.directory.is_dirty()
    }

    /// Resolves `"client:port"`, where the client is a number or a
    /// case-insensitive client name. The port defaults to 0.
    pub fn resolve_address(&mut self, text: &str) -> std::result::Result<Address, AddressError> {
        let (client, port) = Address::split(text)?;
        if let Ok(id) = client.parse::<ClientId>() {
            return Ok(Address::new(id, port));
        }
        self.refresh_directory();
        self.directory
            .find_client(client)
            .map(|id| Address::new(id, port))
            .ok_or_else(|| AddressError::ClientNotFound(client.to_string()))
    }

    // ==================== Ports ====================

    /// Creates a port in the kernel and takes ownership of it.
    pub fn create_port(&mut self, info: PortInfo) -> Result<PortHandle> {
        let handle = self.kernel()?;
        self.ports.create(&*handle, info)
    }

    /// Deletes an owned port. Ports of other clients are refused without
    /// touching the kernel.
    pub fn detach_port(&mut self, port: &PortHandle) -> Result<()> {
        let handle = self.kernel()?;
        self.ports.detach(&*handle, port)
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortInfo> {
        self.ports.iter()
    }

    pub fn port(&mut self, port: &PortHandle) -> Result<Port<'_>> {
        if !self.ports.contains(port.address()) {
            return Err(Error::UnknownPort(port.address()));
        }
        Ok(Port::new(self, port.address()))
    }

    // ==================== Queue ====================

    pub fn queue_binding(&self) -> QueueBinding {
        self.queue
    }

    pub fn queue_id(&self) -> Option<QueueId> {
        self.queue.id()
    }

    /// Allocates a queue owned by this session, freeing a previously owned one.
    pub fn create_queue(&mut self, name: &str) -> Result<QueueId> {
        let handle = self.kernel()?;
        self.release_queue();
        let info = handle.alloc_queue(name)?;
        self.queue = QueueBinding::Owned(info.queue);
        tracing::debug!("Queue {} '{}' allocated", info.queue, name);
        Ok(info.queue)
    }

    /// Binds an existing queue by id without taking ownership.
    pub fn use_queue_id(&mut self, queue: QueueId) -> Result<()> {
        let handle = self.kernel()?;
        let info = handle.queue_info(queue).map_err(|e| match e {
            KernelError::NoSuchQueue(q) => Error::QueueUnavailable(q),
            other => other.into(),
        })?;
        self.bind_existing(&info);
        Ok(())
    }

    /// Binds an existing queue by name. A missing name is an error.
    pub fn use_queue_name(&mut self, name: &str) -> Result<()> {
        let handle = self.kernel()?;
        let info = handle.queue_by_name(name).map_err(|e| match e {
            KernelError::NoSuchQueueName(name) => Error::QueueNotFound(name),
            other => other.into(),
        })?;
        self.bind_existing(&info);
        Ok(())
    }

    /// Binds a queue described by another session.
    pub fn use_external_queue(&mut self, info: &QueueInfo) -> Result<()> {
        self.kernel()?;
        self.bind_existing(info);
        Ok(())
    }

    fn bind_existing(&mut self, info: &QueueInfo) {
        if self.queue.id() == Some(info.queue) {
            return;
        }
        self.release_queue();
        self.queue = if Some(info.owner) == self.client_id() {
            QueueBinding::Owned(info.queue)
        } else {
            QueueBinding::Borrowed(info.queue)
        };
    }

    /// Unbinds the queue, freeing it when owned.
    pub fn release_queue(&mut self) {
        if let (QueueBinding::Owned(queue), Some(handle)) = (self.queue, &self.handle) {
            if let Err(e) = handle.free_queue(queue) {
                tracing::warn!("Failed to free queue {}: {}", queue, e);
            }
        }
        self.queue = QueueBinding::Unbound;
    }

    pub fn queue(&mut self) -> Result<QueueScheduler<'_>> {
        let queue = self.queue.id().ok_or(Error::NoQueue)?;
        Ok(QueueScheduler::new(self, queue))
    }

    // ==================== Output ====================

    /// Buffers `event`, flushing when the local buffer is full.
    pub fn send(&mut self, event: &SequencerEvent) -> Result<()> {
        let handle = self.kernel()?;
        self.output
            .send(&*handle, event, self.config.blocking, self.config.output_timeout)
    }

    /// Writes `event` to the kernel without the local buffer.
    pub fn send_direct(&mut self, event: &SequencerEvent) -> Result<()> {
        let handle = self.kernel()?;
        self.output
            .send_direct(&*handle, event, self.config.blocking, self.config.output_timeout)
    }

    /// Appends `event` without flushing.
    pub fn send_buffered(&mut self, event: &SequencerEvent) -> Result<()> {
        let handle = self.kernel()?;
        self.output.send_buffered(&*handle, event)
    }

    /// Flushes buffered output. Returns the bytes still buffered.
    pub fn drain_output(&mut self) -> Result<usize> {
        let handle = self.kernel()?;
        self.output
            .drain(&*handle, self.config.blocking, self.config.output_timeout)
    }

    pub fn extract_output(&mut self) -> Result<Option<SequencerEvent>> {
        self.output.extract_output()
    }

    /// Removes matching events locally and in the kernel. Returns the
    /// number removed from the local buffer.
    pub fn remove_events(&mut self, criteria: &RemoveCriteria) -> Result<usize> {
        let handle = self.kernel()?;
        self.output.remove_matching(&*handle, criteria)
    }

    /// Bytes waiting in the local output buffer.
    pub fn output_pending(&self) -> usize {
        self.output.pending_bytes()
    }

    /// Flushes, then waits until the kernel has delivered every scheduled
    /// event. `None` waits forever.
    pub fn synchronize_output(&mut self, timeout: Option<Duration>) -> Result<()> {
        let handle = self.kernel()?;
        self.output.drain(&*handle, true, timeout)?;
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let pool = handle.pool_info()?;
            if pool.output_free >= pool.output_pool {
                return Ok(());
            }
            if let (Some(timeout), Some(deadline)) = (timeout, deadline) {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(timeout));
                }
            }
            thread::sleep(SYNC_POLL);
        }
    }

    // ==================== Buffers and pool ====================

    fn or_default<T: Default>(
        &self,
        what: &str,
        f: impl FnOnce(&dyn SequencerHandle) -> KernelResult<T>,
    ) -> T {
        let Some(handle) = &self.handle else {
            return T::default();
        };
        f(&**handle).unwrap_or_else(|e| {
            tracing::warn!("Cannot read {}: {}", what, e);
            T::default()
        })
    }

    fn apply(
        &self,
        what: &str,
        f: impl FnOnce(&dyn SequencerHandle) -> KernelResult<()>,
    ) -> Result<()> {
        let handle = self.kernel()?;
        f(&*handle).map_err(|e| {
            tracing::warn!("Cannot set {}: {}", what, e);
            Error::from(e)
        })
    }

    pub fn output_buffer_size(&self) -> usize {
        self.or_default("output buffer size", |h| h.output_buffer_size())
    }

    pub fn set_output_buffer_size(&mut self, bytes: usize) -> Result<()> {
        self.apply("output buffer size", |h| h.set_output_buffer_size(bytes))
    }

    pub fn input_buffer_size(&self) -> usize {
        self.or_default("input buffer size", |h| h.input_buffer_size())
    }

    pub fn set_input_buffer_size(&mut self, bytes: usize) -> Result<()> {
        self.apply("input buffer size", |h| h.set_input_buffer_size(bytes))
    }

    pub fn pool_info(&self) -> PoolInfo {
        self.or_default("pool info", |h| h.pool_info())
    }

    pub fn set_pool_info(&mut self, pool: &PoolInfo) -> Result<()> {
        self.apply("pool info", |h| h.set_pool_info(pool))
    }

    fn update_pool(&mut self, what: &str, f: impl FnOnce(&mut PoolInfo)) -> Result<()> {
        let handle = self.kernel()?;
        let mut pool = handle.pool_info()?;
        f(&mut pool);
        self.apply(what, |h| h.set_pool_info(&pool))
    }

    pub fn set_pool_output(&mut self, cells: usize) -> Result<()> {
        self.update_pool("output pool", |p| p.output_pool = cells)
    }

    pub fn set_pool_input(&mut self, cells: usize) -> Result<()> {
        self.update_pool("input pool", |p| p.input_pool = cells)
    }

    pub fn set_pool_output_room(&mut self, cells: usize) -> Result<()> {
        self.update_pool("output room", |p| p.output_room = cells)
    }

    pub fn reset_pool_input(&mut self) -> Result<()> {
        self.apply("input pool", |h| h.reset_pool_input())
    }

    pub fn reset_pool_output(&mut self) -> Result<()> {
        self.apply("output pool", |h| h.reset_pool_output())
    }

    pub fn drop_input(&mut self) -> Result<()> {
        self.apply("input", |h| h.drop_input())
    }

    pub fn drop_input_buffer(&mut self) -> Result<()> {
        self.apply("input buffer", |h| h.drop_input_buffer())
    }

    /// Drops the local output buffer and every event still in the kernel pool.
    pub fn drop_output(&mut self) -> Result<()> {
        self.output.clear();
        self.apply("output", |h| h.drop_output())
    }

    /// Drops the local output buffer only.
    pub fn drop_output_buffer(&mut self) {
        self.output.clear();
    }

    pub fn input_pending(&self) -> usize {
        self.or_default("pending input", |h| h.input_pending())
    }

    // ==================== Delivery ====================

    pub fn router(&self) -> Arc<EventRouter> {
        Arc::clone(&self.router)
    }

    /// Delivers every input event to `handler` on the pump thread.
    pub fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        self.router.set_handler(handler);
    }

    pub fn clear_handler(&self) {
        self.router.clear_handler();
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.router.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.router.remove_listener(id)
    }

    /// Enables broadcast delivery to listeners.
    pub fn set_events_enabled(&self, enabled: bool) {
        self.router.set_events_enabled(enabled);
    }

    pub fn events_enabled(&self) -> bool {
        self.router.events_enabled()
    }

    /// The single-subscriber channel, used when no handler is set and
    /// broadcast is off.
    pub fn events(&self) -> Receiver<SequencerEvent> {
        self.router.events()
    }

    // ==================== Input pump ====================

    pub fn start_input(&mut self) -> Result<()> {
        let handle = self.kernel()?;
        if !self.config.mode.can_read() {
            return Err(Error::Kernel(KernelError::PermissionDenied(
                "session was opened without input".into(),
            )));
        }
        let pump = self
            .pump
            .get_or_insert_with(|| EventPump::new(PumpConfig::from(&self.config)));
        pump.start(
            handle,
            Arc::clone(&self.router),
            self.directory.dirty_flag(),
            self.elevator.clone(),
        )
    }

    pub fn stop_input(&mut self) {
        if let Some(pump) = &mut self.pump {
            pump.stop();
        }
    }

    pub fn is_input_running(&self) -> bool {
        self.pump.as_ref().is_some_and(|p| p.is_running())
    }

    pub fn input_state(&self) -> PumpState {
        self.pump.as_ref().map(|p| p.state()).unwrap_or_default()
    }

    /// Whether the pump thread runs with real-time scheduling.
    pub fn is_input_realtime(&self) -> bool {
        self.pump.as_ref().is_some_and(|p| p.is_elevated())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
