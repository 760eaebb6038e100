//! Buffered and direct event output.
//!
//! Records are staged in a local buffer whose byte capacity is the kernel's
//! output buffer size, and written to the kernel on flush. The buffer never
//! holds more than that capacity.
//!
//! In non-blocking mode a full kernel pool is not an error as long as the
//! record still fits locally: unsent records stay buffered for the next
//! flush. Once the buffer is full as well, `send` fails with
//! [`KernelError::WouldBlock`]. Direct sends never touch the buffer; a
//! direct record the kernel cannot take is dropped with a warning. In
//! blocking mode the channel waits for pool room until the caller's timeout
//! (`None` waits forever).

use crate::codec;
use crate::error::{Error, Result};
use crate::kernel::{KernelError, RawRecord, SequencerHandle};
use seqbus_event::{RemoveCriteria, SequencerEvent};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Longest single wait on output readiness.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct OutputChannel {
    buffer: VecDeque<RawRecord>,
    bytes: usize,
}

struct Deadline {
    timeout: Option<Duration>,
    at: Option<Instant>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            at: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    /// Time left for one wait, or `Timeout` once expired.
    fn slice(&self) -> Result<Duration> {
        match (self.timeout, self.at) {
            (Some(timeout), Some(at)) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(Error::Timeout(timeout))
                } else {
                    Ok(left.min(POLL_SLICE))
                }
            }
            _ => Ok(POLL_SLICE),
        }
    }
}

impl OutputChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting in the local buffer.
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn pending_events(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    // ==================== Sending ====================

    /// Buffers `event`, flushing first if the buffer cannot hold it.
    pub fn send(
        &mut self,
        handle: &dyn SequencerHandle,
        event: &SequencerEvent,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let record = codec::encode(event);
        let capacity = self.capacity(handle, &record)?;
        if self.bytes + record.size() > capacity {
            let deadline = Deadline::new(timeout);
            self.flush(handle, blocking, &deadline)?;
            while self.bytes + record.size() > capacity {
                if !blocking {
                    return Err(KernelError::WouldBlock.into());
                }
                handle.poll_output(deadline.slice()?)?;
                self.flush(handle, blocking, &deadline)?;
            }
        }
        self.push(record);
        Ok(())
    }

    /// Writes `event` straight to the kernel, bypassing the local buffer.
    /// A non-blocking write that would block drops the event.
    pub fn send_direct(
        &mut self,
        handle: &dyn SequencerHandle,
        event: &SequencerEvent,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let record = codec::encode(event);
        let deadline = Deadline::new(timeout);
        loop {
            match handle.write(std::slice::from_ref(&record)) {
                Ok(n) if n > 0 => return Ok(()),
                Ok(_) | Err(KernelError::WouldBlock) => {
                    if !blocking {
                        tracing::warn!("Direct output would block, dropping event (kind {})", record.kind);
                        return Ok(());
                    }
                    handle.poll_output(deadline.slice()?)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Appends without flushing.
    pub fn send_buffered(
        &mut self,
        handle: &dyn SequencerHandle,
        event: &SequencerEvent,
    ) -> Result<()> {
        let record = codec::encode(event);
        let capacity = self.capacity(handle, &record)?;
        if self.bytes + record.size() > capacity {
            return Err(Error::OutputBufferFull { capacity });
        }
        self.push(record);
        Ok(())
    }

    /// Flushes the local buffer. Returns the bytes still buffered.
    pub fn drain(
        &mut self,
        handle: &dyn SequencerHandle,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.flush(handle, blocking, &Deadline::new(timeout))
    }

    fn flush(
        &mut self,
        handle: &dyn SequencerHandle,
        blocking: bool,
        deadline: &Deadline,
    ) -> Result<usize> {
        while !self.buffer.is_empty() {
            match handle.write(self.buffer.make_contiguous()) {
                Ok(n) if n > 0 => {
                    for record in self.buffer.drain(..n) {
                        self.bytes -= record.size();
                    }
                }
                Ok(_) | Err(KernelError::WouldBlock) => {
                    if !blocking {
                        break;
                    }
                    handle.poll_output(deadline.slice()?)?;
                }
                Err(e) => {
                    // The kernel rejected the front record; it can never be sent.
                    if let Some(record) = self.buffer.pop_front() {
                        self.bytes -= record.size();
                        tracing::warn!("Discarding rejected output event (kind {}): {}", record.kind, e);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(self.bytes)
    }

    // ==================== Inspection ====================

    /// Removes and decodes the first buffered event without sending it.
    /// A record that fails to decode stays at the front.
    pub fn extract_output(&mut self) -> Result<Option<SequencerEvent>> {
        let Some(record) = self.buffer.front() else {
            return Ok(None);
        };
        let event = codec::decode(record)?;
        if let Some(record) = self.buffer.pop_front() {
            self.bytes -= record.size();
        }
        Ok(Some(event))
    }

    /// Drops matching events from the local buffer and asks the kernel to
    /// drop matching pooled events. Returns the number removed locally.
    pub fn remove_matching(
        &mut self,
        handle: &dyn SequencerHandle,
        criteria: &RemoveCriteria,
    ) -> Result<usize> {
        let mut removed = 0;
        if criteria.output {
            let before = self.buffer.len();
            self.buffer.retain(|record| {
                !codec::decode(record)
                    .map(|event| criteria.matches(&event))
                    .unwrap_or(false)
            });
            removed = before - self.buffer.len();
            self.bytes = self.buffer.iter().map(RawRecord::size).sum();
        }
        if criteria.input || criteria.output {
            handle.remove_events(criteria)?;
        }
        Ok(removed)
    }

    /// Discards the local buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.bytes = 0;
    }

    fn push(&mut self, record: RawRecord) {
        self.bytes += record.size();
        self.buffer.push_back(record);
    }

    fn capacity(&self, handle: &dyn SequencerHandle, record: &RawRecord) -> Result<usize> {
        let capacity = handle.output_buffer_size()?;
        if record.size() > capacity {
            return Err(Error::OutputBufferFull { capacity });
        }
        Ok(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{SequencerBackend, VirtualSequencer, RECORD_HEADER_SIZE};
    use seqbus_event::{Address, OpenMode, PoolInfo, PortInfo, QueueId};
    use std::sync::Arc;

    fn setup() -> (VirtualSequencer, Arc<dyn SequencerHandle>, Address) {
        let bus = VirtualSequencer::new();
        let handle = bus.open("default", OpenMode::Duplex, false).unwrap();
        let port = handle
            .create_port(&PortInfo::duplex("loop"))
            .unwrap()
            .address()
            .unwrap();
        (bus, handle, port)
    }

    #[test]
    fn test_send_buffers_until_drain() {
        let (_bus, handle, port) = setup();
        let mut out = OutputChannel::new();
        out.send(&*handle, &SequencerEvent::note_on(0, 60, 1).to(port), false, None)
            .unwrap();
        assert_eq!(out.pending_events(), 1);
        assert_eq!(handle.input_pending().unwrap(), 0);

        assert_eq!(out.drain(&*handle, false, None).unwrap(), 0);
        assert_eq!(handle.input_pending().unwrap(), 1);
    }

    #[test]
    fn test_send_buffered_reports_full() {
        let (_bus, handle, port) = setup();
        handle.set_output_buffer_size(RECORD_HEADER_SIZE * 2).unwrap();
        let mut out = OutputChannel::new();
        let event = SequencerEvent::note_on(0, 60, 1).to(port);
        out.send_buffered(&*handle, &event).unwrap();
        out.send_buffered(&*handle, &event).unwrap();
        assert!(matches!(
            out.send_buffered(&*handle, &event),
            Err(Error::OutputBufferFull { capacity }) if capacity == RECORD_HEADER_SIZE * 2
        ));
    }

    #[test]
    fn test_send_auto_flushes() {
        let (_bus, handle, port) = setup();
        handle.set_output_buffer_size(RECORD_HEADER_SIZE * 2).unwrap();
        let mut out = OutputChannel::new();
        let event = SequencerEvent::note_on(0, 60, 1).to(port);
        for _ in 0..3 {
            out.send(&*handle, &event, false, None).unwrap();
        }
        assert_eq!(handle.input_pending().unwrap(), 2);
        assert_eq!(out.pending_events(), 1);
    }

    #[test]
    fn test_would_block_keeps_records() {
        let (_bus, handle, port) = setup();
        handle
            .set_pool_info(&PoolInfo {
                output_pool: 1,
                ..Default::default()
            })
            .unwrap();
        let queue = handle.alloc_queue("q").unwrap().queue;
        let event = SequencerEvent::note_on(0, 60, 1).to(port).at_tick(queue, 100);

        let mut out = OutputChannel::new();
        out.send(&*handle, &event, false, None).unwrap();
        out.send(&*handle, &event, false, None).unwrap();
        let left = out.drain(&*handle, false, None).unwrap();
        assert_eq!(left, RECORD_HEADER_SIZE);
        assert_eq!(out.pending_events(), 1);
    }

    /// Shrinks the output pool to one cell and fills it with a pending event.
    fn full_pool(handle: &Arc<dyn SequencerHandle>, port: Address) -> (SequencerEvent, QueueId) {
        handle
            .set_pool_info(&PoolInfo {
                output_pool: 1,
                ..Default::default()
            })
            .unwrap();
        let queue = handle.alloc_queue("q").unwrap().queue;
        let event = SequencerEvent::note_on(0, 60, 1).to(port).at_tick(queue, 100);
        handle.write(&[codec::encode(&event)]).unwrap();
        (event, queue)
    }

    #[test]
    fn test_send_direct_never_buffers() {
        let (_bus, handle, port) = setup();
        let (_, queue) = full_pool(&handle, port);
        let mut out = OutputChannel::new();

        let buffered = SequencerEvent::note_on(0, 2, 1).to(port).at_tick(queue, 200);
        out.send_buffered(&*handle, &buffered).unwrap();
        let direct = SequencerEvent::note_on(0, 3, 1).to(port).at_tick(queue, 300);
        out.send_direct(&*handle, &direct, false, None).unwrap();

        assert_eq!(out.pending_events(), 1);
        assert_eq!(out.pending_bytes(), RECORD_HEADER_SIZE);
        let first = out.extract_output().unwrap().unwrap();
        assert_eq!(first.data, buffered.data);
        assert_eq!(out.extract_output().unwrap(), None);
    }

    #[test]
    fn test_non_blocking_send_respects_capacity() {
        let (_bus, handle, port) = setup();
        let (event, _) = full_pool(&handle, port);
        let capacity = RECORD_HEADER_SIZE * 2;
        handle.set_output_buffer_size(capacity).unwrap();
        let mut out = OutputChannel::new();

        let mut refused = 0;
        for _ in 0..100 {
            match out.send(&*handle, &event, false, None) {
                Ok(()) => {}
                Err(Error::Kernel(KernelError::WouldBlock)) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
            assert!(out.pending_bytes() <= capacity);
        }
        assert_eq!(out.pending_events(), 2);
        assert_eq!(refused, 98);
    }

    #[test]
    fn test_extract_keeps_undecodable_record() {
        let (_bus, handle, port) = setup();
        let mut out = OutputChannel::new();
        let mut broken = codec::encode(&SequencerEvent::note_on(0, 60, 1).to(port));
        broken.kind = seqbus_event::kind::USR_VAR0;
        out.push(broken);

        assert!(matches!(out.extract_output(), Err(Error::Decode(_))));
        assert_eq!(out.pending_events(), 1);
        assert_eq!(out.pending_bytes(), RECORD_HEADER_SIZE);
        assert_eq!(handle.input_pending().unwrap(), 0);
    }

    #[test]
    fn test_blocking_drain_times_out() {
        let (_bus, handle, port) = setup();
        handle
            .set_pool_info(&PoolInfo {
                output_pool: 1,
                ..Default::default()
            })
            .unwrap();
        let queue = handle.alloc_queue("q").unwrap().queue;
        let event = SequencerEvent::note_on(0, 60, 1).to(port).at_tick(queue, 100);

        let mut out = OutputChannel::new();
        out.send_direct(&*handle, &event, false, None).unwrap();
        out.send_buffered(&*handle, &event).unwrap();
        let started = Instant::now();
        let result = out.drain(&*handle, true, Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_rejected_record_is_discarded() {
        let (_bus, handle, port) = setup();
        let mut out = OutputChannel::new();
        out.send_buffered(&*handle, &SequencerEvent::note_on(0, 60, 1).to(port).at_tick(9, 0))
            .unwrap();
        assert!(matches!(
            out.drain(&*handle, false, None),
            Err(Error::Kernel(KernelError::NoSuchQueue(9)))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_extract_and_remove() {
        let (_bus, handle, port) = setup();
        let mut out = OutputChannel::new();
        assert_eq!(out.extract_output().unwrap(), None);

        out.send_buffered(&*handle, &SequencerEvent::note_on(3, 60, 1).to(port))
            .unwrap();
        out.send_buffered(&*handle, &SequencerEvent::note_on(4, 60, 1).to(port))
            .unwrap();
        let removed = out
            .remove_matching(&*handle, &RemoveCriteria::output().channel(3))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(out.pending_bytes(), RECORD_HEADER_SIZE);

        let first = out.extract_output().unwrap().unwrap();
        assert_eq!(first.channel(), Some(4));
        assert_eq!(out.extract_output().unwrap(), None);
        assert_eq!(out.pending_bytes(), 0);
    }
}
