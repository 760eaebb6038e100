//! Boundary to the kernel sequencer.
//!
//! The session layer talks to the kernel only through [`SequencerHandle`].
//! [`VirtualSequencer`] is an in-process kernel used by tests and by
//! applications that want a private bus.

mod record;
pub use record::{RawRecord, RecordFlags, QUEUE_DIRECT, RECORD_HEADER_SIZE};

mod virtual_seq;
pub use virtual_seq::VirtualSequencer;

use seqbus_event::{
    Address, ClientId, ClientInfo, OpenMode, PoolInfo, PortId, PortInfo, QueueId, QueueInfo,
    QueueStatus, QueueTempo, QueueTimer, RemoveCriteria, SubscriberDirection, Subscription,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("operation would block")]
    WouldBlock,

    #[error("no such client {0}")]
    NoSuchClient(ClientId),

    #[error("no such port {0}")]
    NoSuchPort(Address),

    #[error("no such queue {0}")]
    NoSuchQueue(QueueId),

    #[error("no queue named '{0}'")]
    NoSuchQueueName(String),

    #[error("no subscription {sender} -> {dest}")]
    NotSubscribed { sender: Address, dest: Address },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("handle is closed")]
    Closed,

    #[error("no such device '{0}'")]
    NoDevice(String),
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Opens kernel connections.
pub trait SequencerBackend: Send + Sync {
    fn open(
        &self,
        device: &str,
        mode: OpenMode,
        blocking: bool,
    ) -> KernelResult<Arc<dyn SequencerHandle>>;
}

/// One open kernel client.
///
/// Every call fails with [`KernelError::Closed`] once the handle is closed.
pub trait SequencerHandle: Send + Sync {
    // ==================== Identity ====================

    fn client_id(&self) -> ClientId;
    fn is_open(&self) -> bool;
    /// Releases the client together with its ports and queues. Idempotent.
    fn close(&self);
    fn set_blocking(&self, blocking: bool) -> KernelResult<()>;

    // ==================== Clients ====================

    fn client_info(&self, client: ClientId) -> KernelResult<ClientInfo>;
    /// Only the handle's own client can be updated.
    fn set_client_info(&self, info: &ClientInfo) -> KernelResult<()>;
    /// First client with an id greater than `after` (`None` starts at the beginning).
    fn next_client(&self, after: Option<ClientId>) -> KernelResult<Option<ClientInfo>>;
    fn next_port(&self, client: ClientId, after: Option<PortId>)
        -> KernelResult<Option<PortInfo>>;

    // ==================== Ports ====================

    /// Returns the record with the kernel-assigned client and port ids.
    fn create_port(&self, info: &PortInfo) -> KernelResult<PortInfo>;
    fn delete_port(&self, port: Address) -> KernelResult<()>;
    fn port_info(&self, port: Address) -> KernelResult<PortInfo>;
    fn set_port_info(&self, info: &PortInfo) -> KernelResult<()>;

    // ==================== Subscriptions ====================

    fn subscribe(&self, subscription: &Subscription) -> KernelResult<()>;
    fn unsubscribe(&self, sender: Address, dest: Address) -> KernelResult<()>;
    fn query_subscribers(
        &self,
        port: Address,
        direction: SubscriberDirection,
    ) -> KernelResult<Vec<Subscription>>;

    // ==================== Queues ====================

    fn alloc_queue(&self, name: &str) -> KernelResult<QueueInfo>;
    fn free_queue(&self, queue: QueueId) -> KernelResult<()>;
    fn queue_by_name(&self, name: &str) -> KernelResult<QueueInfo>;
    fn queue_info(&self, queue: QueueId) -> KernelResult<QueueInfo>;
    fn set_queue_info(&self, info: &QueueInfo) -> KernelResult<()>;
    fn queue_status(&self, queue: QueueId) -> KernelResult<QueueStatus>;
    fn queue_tempo(&self, queue: QueueId) -> KernelResult<QueueTempo>;
    fn set_queue_tempo(&self, tempo: &QueueTempo) -> KernelResult<()>;
    fn queue_timer(&self, queue: QueueId) -> KernelResult<QueueTimer>;
    fn set_queue_timer(&self, timer: &QueueTimer) -> KernelResult<()>;

    // ==================== Event I/O ====================

    /// Accepts records in order and returns how many were taken. Fails only
    /// when the first record cannot be taken.
    fn write(&self, records: &[RawRecord]) -> KernelResult<usize>;
    fn read(&self) -> KernelResult<Option<RawRecord>>;
    fn input_pending(&self) -> KernelResult<usize>;
    /// Waits up to `timeout` for input; `Ok(false)` on timeout.
    fn poll_input(&self, timeout: Duration) -> KernelResult<bool>;
    /// Waits up to `timeout` for output pool room; `Ok(false)` on timeout.
    fn poll_output(&self, timeout: Duration) -> KernelResult<bool>;
    /// Returns how many events were removed.
    fn remove_events(&self, criteria: &RemoveCriteria) -> KernelResult<usize>;
    fn drop_input(&self) -> KernelResult<()>;
    fn drop_input_buffer(&self) -> KernelResult<()>;
    fn drop_output(&self) -> KernelResult<()>;

    // ==================== Buffers and pool ====================

    fn output_buffer_size(&self) -> KernelResult<usize>;
    fn set_output_buffer_size(&self, bytes: usize) -> KernelResult<()>;
    fn input_buffer_size(&self) -> KernelResult<usize>;
    fn set_input_buffer_size(&self, bytes: usize) -> KernelResult<()>;
    fn pool_info(&self) -> KernelResult<PoolInfo>;
    fn set_pool_info(&self, pool: &PoolInfo) -> KernelResult<()>;
    fn reset_pool_input(&self) -> KernelResult<()>;
    fn reset_pool_output(&self) -> KernelResult<()>;
}
