//! In-process kernel sequencer.
//!
//! Implements the subset of kernel behaviour the session layer relies on:
//! client and port registries, subscriptions with announcements, routing to
//! addresses, subscribers and broadcast, per-client input FIFOs bounded by
//! the input pool, and queues that release scheduled events by tick or real
//! time at the queue's tempo and skew.
//!
//! Queue time is computed from the wall clock whenever the bus is touched;
//! nothing runs in the background.

use super::{
    KernelError, KernelResult, RawRecord, RecordFlags, SequencerBackend, SequencerHandle,
    QUEUE_DIRECT, RECORD_HEADER_SIZE,
};
use crate::codec;
use parking_lot::{Condvar, Mutex};
use seqbus_event::address::{
    ADDRESS_BROADCAST, ADDRESS_SUBSCRIBERS, FIRST_USER_CLIENT, SYSTEM_ANNOUNCE_PORT,
    SYSTEM_CLIENT, SYSTEM_TIMER_PORT,
};
use seqbus_event::{
    kind, Address, ClientId, ClientInfo, ClientType, OpenMode, PoolInfo, PortCapability, PortId,
    PortInfo, PortType, QueueId, QueueInfo, QueueStatus, QueueTempo, QueueTimer, RealTime,
    RemoveCriteria, SubscriberDirection, Subscription, Timestamping,
};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LAST_USER_CLIENT: ClientId = 191;
const MAX_QUEUES: QueueId = 32;
const MAX_PORTS: usize = 254;
const DEVICES: &[&str] = &["default", "hw"];

pub const DEFAULT_OUTPUT_BUFFER: usize = 16 * 1024;
pub const DEFAULT_INPUT_BUFFER: usize = 500 * RECORD_HEADER_SIZE;

/// Queue control can start a queue whose events are already due.
const MAX_ADVANCE_ROUNDS: usize = 8;
const MIN_WAIT: Duration = Duration::from_micros(100);

// ==================== Queue clock ====================

struct Pending {
    /// Absolute tick, or nanoseconds on the real-time axis.
    due: u64,
    high: bool,
    seq: u64,
    owner: ClientId,
    record: RawRecord,
}

impl Pending {
    fn key(&self) -> (u64, bool, u64) {
        (self.due, !self.high, self.seq)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct QueueSlot {
    info: QueueInfo,
    tempo: QueueTempo,
    timer: QueueTimer,
    running: bool,
    base_tick: f64,
    base_nanos: u64,
    anchor: Instant,
    by_tick: BinaryHeap<Reverse<Pending>>,
    by_time: BinaryHeap<Reverse<Pending>>,
}

impl QueueSlot {
    fn new(queue: QueueId, name: &str, owner: ClientId, now: Instant) -> Self {
        Self {
            info: QueueInfo {
                queue,
                name: name.to_string(),
                owner,
                locked: true,
            },
            tempo: QueueTempo::new(queue),
            timer: QueueTimer {
                queue,
                resolution: 1000,
                ..Default::default()
            },
            running: false,
            base_tick: 0.0,
            base_nanos: 0,
            anchor: now,
            by_tick: BinaryHeap::new(),
            by_time: BinaryHeap::new(),
        }
    }

    /// Current (tick, nanoseconds) of the queue.
    fn position(&self, now: Instant) -> (f64, u64) {
        if !self.running {
            return (self.base_tick, self.base_nanos);
        }
        let elapsed = now.saturating_duration_since(self.anchor).as_nanos() as f64
            * self.tempo.tempo_factor();
        let per_tick = self.tempo.nanos_per_tick();
        let ticks = if per_tick > 0.0 { elapsed / per_tick } else { 0.0 };
        (
            self.base_tick + ticks,
            self.base_nanos.saturating_add(elapsed as u64),
        )
    }

    fn rebase(&mut self, now: Instant) {
        let (tick, nanos) = self.position(now);
        self.base_tick = tick;
        self.base_nanos = nanos;
        self.anchor = now;
    }

    fn start(&mut self, now: Instant) {
        self.base_tick = 0.0;
        self.base_nanos = 0;
        self.anchor = now;
        self.running = true;
    }

    fn resume(&mut self, now: Instant) {
        if !self.running {
            self.anchor = now;
            self.running = true;
        }
    }

    fn stop(&mut self, now: Instant) {
        self.rebase(now);
        self.running = false;
    }

    fn set_tick(&mut self, now: Instant, tick: u32) {
        self.rebase(now);
        self.base_tick = tick as f64;
    }

    fn set_time(&mut self, now: Instant, time: RealTime) {
        self.rebase(now);
        self.base_nanos = time.as_nanos();
    }

    fn set_tempo(&mut self, now: Instant, tempo: QueueTempo) {
        self.rebase(now);
        self.tempo = QueueTempo {
            queue: self.info.queue,
            ..tempo
        };
    }

    fn events(&self) -> usize {
        self.by_tick.len() + self.by_time.len()
    }

    /// Converts relative times to absolute and queues the record.
    fn schedule(&mut self, now: Instant, mut record: RawRecord, owner: ClientId, seq: u64) {
        let (tick, nanos) = self.position(now);
        let relative = record.is_relative();
        record.flags.remove(RecordFlags::RELATIVE);
        let high = record.flags.contains(RecordFlags::HIGH_PRIORITY);

        if record.is_real_time() {
            let mut due = record.real_time().as_nanos();
            if relative {
                due = due.saturating_add(nanos);
                record.set_real_time(RealTime::from(Duration::from_nanos(due)));
            }
            self.by_time.push(Reverse(Pending {
                due,
                high,
                seq,
                owner,
                record,
            }));
        } else {
            let mut due = record.tick() as u64;
            if relative {
                due = due.saturating_add(tick.floor() as u64);
                record.set_tick(due.min(u32::MAX as u64) as u32);
            }
            self.by_tick.push(Reverse(Pending {
                due,
                high,
                seq,
                owner,
                record,
            }));
        }
    }

    fn take_due(&mut self, now: Instant) -> Vec<Pending> {
        let mut due = Vec::new();
        if !self.running {
            return due;
        }
        let (tick, nanos) = self.position(now);
        let tick = tick.floor() as u64;
        while self.by_tick.peek().is_some_and(|Reverse(p)| p.due <= tick) {
            if let Some(Reverse(p)) = self.by_tick.pop() {
                due.push(p);
            }
        }
        while self.by_time.peek().is_some_and(|Reverse(p)| p.due <= nanos) {
            if let Some(Reverse(p)) = self.by_time.pop() {
                due.push(p);
            }
        }
        due
    }

    /// Wall-clock time until the next queued event falls due.
    fn next_deadline(&self, now: Instant) -> Option<Duration> {
        let factor = self.tempo.tempo_factor();
        if !self.running || factor <= 0.0 {
            return None;
        }
        let (tick, nanos) = self.position(now);
        let by_tick = self
            .by_tick
            .peek()
            .map(|Reverse(p)| (p.due as f64 - tick).max(0.0) * self.tempo.nanos_per_tick());
        let by_time = self
            .by_time
            .peek()
            .map(|Reverse(p)| p.due.saturating_sub(nanos) as f64);
        let nanos = match (by_tick, by_time) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b)?,
        };
        Some(Duration::from_nanos((nanos / factor).ceil() as u64))
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&Pending) -> bool) -> Vec<Pending> {
        let mut removed = Vec::new();
        for heap in [&mut self.by_tick, &mut self.by_time] {
            let (gone, kept): (Vec<_>, Vec<_>) =
                std::mem::take(heap).into_iter().partition(|Reverse(p)| pred(p));
            *heap = kept.into_iter().collect();
            removed.extend(gone.into_iter().map(|Reverse(p)| p));
        }
        removed
    }
}

// ==================== Bus state ====================

struct ClientSlot {
    info: ClientInfo,
    mode: OpenMode,
    blocking: bool,
    ports: BTreeMap<PortId, PortInfo>,
    input: VecDeque<RawRecord>,
    pool: PoolInfo,
    /// Output pool cells held by events waiting in queues.
    scheduled: usize,
    output_buffer: usize,
    input_buffer: usize,
}

impl ClientSlot {
    fn new(info: ClientInfo, mode: OpenMode, blocking: bool) -> Self {
        let pool = PoolInfo {
            client: info.client,
            ..Default::default()
        };
        Self {
            info,
            mode,
            blocking,
            ports: BTreeMap::new(),
            input: VecDeque::new(),
            pool,
            scheduled: 0,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            input_buffer: DEFAULT_INPUT_BUFFER,
        }
    }

    fn system() -> Self {
        let mut info = ClientInfo::new(SYSTEM_CLIENT, "System");
        info.client_type = ClientType::Kernel;
        let mut slot = Self::new(info, OpenMode::Duplex, false);

        let mut timer = PortInfo::new(
            "Timer",
            PortCapability::READABLE | PortCapability::WRITE,
            PortType::empty(),
        );
        timer.port = Some(SYSTEM_TIMER_PORT);
        let mut announce = PortInfo::new("Announce", PortCapability::READABLE, PortType::empty());
        announce.port = Some(SYSTEM_ANNOUNCE_PORT);
        slot.ports.insert(SYSTEM_TIMER_PORT, timer);
        slot.ports.insert(SYSTEM_ANNOUNCE_PORT, announce);
        slot
    }

    fn output_writable(&self) -> bool {
        self.scheduled + self.pool.output_room <= self.pool.output_pool
    }

    fn pool_snapshot(&self) -> PoolInfo {
        PoolInfo {
            client: self.info.client,
            output_free: self.pool.output_pool.saturating_sub(self.scheduled),
            input_free: self.pool.input_pool.saturating_sub(self.input.len()),
            ..self.pool
        }
    }
}

struct BusState {
    clients: BTreeMap<ClientId, ClientSlot>,
    queues: BTreeMap<QueueId, QueueSlot>,
    subscriptions: Vec<Subscription>,
    seq: u64,
}

impl BusState {
    fn new() -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(SYSTEM_CLIENT, ClientSlot::system());
        Self {
            clients,
            queues: BTreeMap::new(),
            subscriptions: Vec::new(),
            seq: 0,
        }
    }

    fn own(&self, client: ClientId) -> KernelResult<&ClientSlot> {
        self.clients.get(&client).ok_or(KernelError::Closed)
    }

    fn own_mut(&mut self, client: ClientId) -> KernelResult<&mut ClientSlot> {
        self.clients.get_mut(&client).ok_or(KernelError::Closed)
    }

    fn port(&self, addr: Address) -> KernelResult<&PortInfo> {
        self.clients
            .get(&addr.client)
            .ok_or(KernelError::NoSuchClient(addr.client))?
            .ports
            .get(&addr.port)
            .ok_or(KernelError::NoSuchPort(addr))
    }

    fn queue(&self, queue: QueueId) -> KernelResult<&QueueSlot> {
        self.queues.get(&queue).ok_or(KernelError::NoSuchQueue(queue))
    }

    fn queue_mut(&mut self, queue: QueueId) -> KernelResult<&mut QueueSlot> {
        self.queues
            .get_mut(&queue)
            .ok_or(KernelError::NoSuchQueue(queue))
    }

    fn port_snapshot(&self, addr: Address) -> KernelResult<PortInfo> {
        let mut info = self.port(addr)?.clone();
        info.read_subscribers = self.subscribers(addr, SubscriberDirection::Read);
        info.write_subscribers = self.subscribers(addr, SubscriberDirection::Write);
        Ok(info)
    }

    fn client_snapshot(&self, client: ClientId) -> KernelResult<ClientInfo> {
        let slot = self
            .clients
            .get(&client)
            .ok_or(KernelError::NoSuchClient(client))?;
        let mut info = slot.info.clone();
        info.num_ports = slot.ports.len();
        Ok(info)
    }

    fn subscribers(&self, addr: Address, direction: SubscriberDirection) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| match direction {
                SubscriberDirection::Read => s.sender == addr,
                SubscriberDirection::Write => s.dest == addr,
            })
            .copied()
            .collect()
    }

    // ==================== Time ====================

    /// Delivers every queued event that is due. Returns whether anything moved.
    fn advance(&mut self, now: Instant) -> bool {
        let mut moved = false;
        for _ in 0..MAX_ADVANCE_ROUNDS {
            let due: Vec<Pending> = self
                .queues
                .values_mut()
                .flat_map(|q| q.take_due(now))
                .collect();
            if due.is_empty() {
                break;
            }
            moved = true;
            for pending in due {
                if let Some(slot) = self.clients.get_mut(&pending.owner) {
                    slot.scheduled = slot.scheduled.saturating_sub(1);
                }
                if let Err(e) = self.dispatch(pending.record, pending.owner, now) {
                    tracing::trace!("Dropped scheduled event from {}: {}", pending.owner, e);
                }
            }
        }
        moved
    }

    fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.queues
            .values()
            .filter_map(|q| q.next_deadline(now))
            .min()
    }

    fn stamp(&self, record: &mut RawRecord, stamping: Timestamping, now: Instant) {
        if let Some(queue) = self.queues.get(&stamping.queue) {
            let (tick, nanos) = queue.position(now);
            record.queue = stamping.queue;
            record.flags.remove(RecordFlags::RELATIVE);
            if stamping.real_time {
                record.set_real_time(RealTime::from(Duration::from_nanos(nanos)));
            } else {
                record.set_tick(tick.floor().min(u32::MAX as f64) as u32);
            }
        }
    }

    // ==================== Routing ====================

    fn dispatch(&mut self, record: RawRecord, sender: ClientId, now: Instant) -> KernelResult<()> {
        match record.dest.client {
            ADDRESS_SUBSCRIBERS => {
                self.deliver_to_subscribers(record, now);
                Ok(())
            }
            ADDRESS_BROADCAST => {
                self.broadcast(record, sender, now);
                Ok(())
            }
            SYSTEM_CLIENT if record.dest.port == SYSTEM_TIMER_PORT => {
                self.queue_control(record, sender, now)
            }
            _ => {
                let dest = record.dest;
                let port = self.port(dest)?;
                if sender != dest.client && !port.capability.contains(PortCapability::WRITE) {
                    return Err(KernelError::PermissionDenied(format!(
                        "port {} is not writable",
                        dest
                    )));
                }
                let stamping = port.timestamping;
                self.enqueue_input(dest.client, record, stamping, now);
                Ok(())
            }
        }
    }

    fn deliver_to_subscribers(&mut self, record: RawRecord, now: Instant) {
        let subs = self.subscribers(record.source, SubscriberDirection::Read);
        for sub in subs {
            let stamping = if sub.time_update {
                sub.queue.map(|queue| Timestamping {
                    queue,
                    real_time: sub.time_real,
                })
            } else {
                self.port(sub.dest).ok().and_then(|p| p.timestamping)
            };
            let mut copy = record.clone();
            copy.dest = sub.dest;
            self.enqueue_input(sub.dest.client, copy, stamping, now);
        }
    }

    fn broadcast(&mut self, record: RawRecord, sender: ClientId, now: Instant) {
        let targets: Vec<ClientId> = self
            .clients
            .values()
            .filter(|slot| {
                slot.info.client != sender
                    && slot.info.broadcast_filter
                    && slot.info.client_type == ClientType::User
            })
            .map(|slot| slot.info.client)
            .collect();
        for client in targets {
            self.enqueue_input(client, record.clone(), None, now);
        }
    }

    /// Input pool overflow counts as a lost event rather than a send error.
    fn enqueue_input(
        &mut self,
        client: ClientId,
        mut record: RawRecord,
        stamping: Option<Timestamping>,
        now: Instant,
    ) {
        if let Some(stamping) = stamping {
            self.stamp(&mut record, stamping, now);
        }
        let Some(slot) = self.clients.get_mut(&client) else {
            return;
        };
        if slot.info.client_type == ClientType::Kernel
            || !slot.mode.can_read()
            || !slot.info.accepts(record.kind)
        {
            return;
        }
        if slot.input.len() >= slot.pool.input_pool {
            slot.info.events_lost += 1;
            return;
        }
        slot.input.push_back(record);
    }

    fn queue_control(
        &mut self,
        record: RawRecord,
        sender: ClientId,
        now: Instant,
    ) -> KernelResult<()> {
        let queue_id = record.data[0];
        let queue = self.queue_mut(queue_id)?;
        if queue.info.locked && queue.info.owner != sender && sender != SYSTEM_CLIENT {
            return Err(KernelError::PermissionDenied(format!(
                "queue {} is locked by client {}",
                queue_id, queue.info.owner
            )));
        }
        match record.kind {
            kind::START => queue.start(now),
            kind::STOP => queue.stop(now),
            kind::CONTINUE => queue.resume(now),
            kind::SET_POSITION_TICK => queue.set_tick(now, record.u32_at(4)),
            kind::SET_POSITION_TIME => {
                queue.set_time(now, RealTime::new(record.u32_at(4), record.u32_at(8)))
            }
            kind::TEMPO => {
                let usec_per_beat = record.u32_at(4);
                if usec_per_beat == 0 {
                    return Err(KernelError::InvalidArgument("zero tempo".into()));
                }
                let tempo = QueueTempo {
                    usec_per_beat,
                    ..queue.tempo
                };
                queue.set_tempo(now, tempo);
            }
            kind::QUEUE_SKEW => {
                let (skew_value, skew_base) = (record.u32_at(4), record.u32_at(8));
                if skew_base == 0 {
                    return Err(KernelError::InvalidArgument("zero skew base".into()));
                }
                let tempo = QueueTempo {
                    skew_value,
                    skew_base,
                    ..queue.tempo
                };
                queue.set_tempo(now, tempo);
            }
            kind::CLOCK | kind::TICK => {}
            other => {
                return Err(KernelError::InvalidArgument(format!(
                    "kind {} is not a queue control",
                    other
                )))
            }
        }

        // Echo to clients listening on the timer port.
        let mut echo = record;
        echo.source = Address::SYSTEM_TIMER;
        echo.queue = QUEUE_DIRECT;
        echo.time = [0; 2];
        echo.flags.remove(RecordFlags::REAL_TIME | RecordFlags::RELATIVE);
        self.deliver_to_subscribers(echo, now);
        Ok(())
    }

    fn announce(&mut self, kind: u8, bytes: &[u8], now: Instant) {
        let mut record = RawRecord::new(kind);
        record.source = Address::SYSTEM_ANNOUNCE;
        record.dest = Address::new(ADDRESS_SUBSCRIBERS, 0);
        record.data[..bytes.len()].copy_from_slice(bytes);
        self.deliver_to_subscribers(record, now);
    }

    fn announce_subscription(&mut self, subscribed: bool, sub: &Subscription, now: Instant) {
        let kind = if subscribed {
            kind::PORT_SUBSCRIBED
        } else {
            kind::PORT_UNSUBSCRIBED
        };
        let bytes = [
            sub.sender.client,
            sub.sender.port,
            sub.dest.client,
            sub.dest.port,
        ];
        self.announce(kind, &bytes, now);
    }

    // ==================== Output ====================

    fn accept(&mut self, client: ClientId, mut record: RawRecord, now: Instant) -> KernelResult<()> {
        record.source.client = client;
        if !record.is_scheduled() {
            return self.dispatch(record, client, now);
        }
        let slot = self.own(client)?;
        if slot.scheduled + 1 > slot.pool.output_pool {
            return Err(KernelError::WouldBlock);
        }
        self.seq += 1;
        let seq = self.seq;
        self.queue_mut(record.queue)?
            .schedule(now, record, client, seq);
        self.own_mut(client)?.scheduled += 1;
        Ok(())
    }

    fn write(&mut self, client: ClientId, records: &[RawRecord], now: Instant) -> KernelResult<usize> {
        if !self.own(client)?.mode.can_write() {
            return Err(KernelError::PermissionDenied(
                "client was opened without output".into(),
            ));
        }
        let mut accepted = 0;
        for record in records {
            match self.accept(client, record.clone(), now) {
                Ok(()) => accepted += 1,
                Err(e) if accepted == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(accepted)
    }

    /// Removes queued events of `client` matching `filter`, releasing pool cells.
    fn remove_output(&mut self, client: ClientId, filter: &dyn Fn(&RawRecord) -> bool) -> usize {
        let mut removed = 0;
        for queue in self.queues.values_mut() {
            removed += queue
                .remove_where(|p| p.owner == client && filter(&p.record))
                .len();
        }
        if let Some(slot) = self.clients.get_mut(&client) {
            slot.scheduled = slot.scheduled.saturating_sub(removed);
        }
        removed
    }

    fn release(&mut self, pending: Vec<Pending>) {
        for p in pending {
            if let Some(slot) = self.clients.get_mut(&p.owner) {
                slot.scheduled = slot.scheduled.saturating_sub(1);
            }
        }
    }

    // ==================== Ports and subscriptions ====================

    fn create_port(&mut self, client: ClientId, info: &PortInfo, now: Instant) -> KernelResult<PortInfo> {
        let slot = self.own_mut(client)?;
        if slot.ports.len() >= MAX_PORTS {
            return Err(KernelError::NoSpace("port table full".into()));
        }
        let port = match info.port {
            Some(port) if slot.ports.contains_key(&port) => {
                return Err(KernelError::Busy(format!("port {} exists", port)))
            }
            Some(port) => port,
            None => (0..=MAX_PORTS as PortId)
                .find(|p| !slot.ports.contains_key(p))
                .ok_or_else(|| KernelError::NoSpace("port table full".into()))?,
        };
        let mut created = info.clone();
        created.client = client;
        created.port = Some(port);
        created.read_subscribers.clear();
        created.write_subscribers.clear();
        slot.ports.insert(port, created);

        self.announce(kind::PORT_START, &[client, port], now);
        self.port_snapshot(Address::new(client, port))
    }

    fn delete_port(&mut self, client: ClientId, addr: Address, now: Instant) -> KernelResult<()> {
        if addr.client != client {
            return Err(KernelError::PermissionDenied(format!(
                "port {} belongs to another client",
                addr
            )));
        }
        self.port(addr)?;
        self.drop_port_subscriptions(addr, now);
        if let Some(slot) = self.clients.get_mut(&client) {
            slot.ports.remove(&addr.port);
        }
        self.announce(kind::PORT_EXIT, &[addr.client, addr.port], now);
        Ok(())
    }

    fn drop_port_subscriptions(&mut self, addr: Address, now: Instant) {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscriptions)
            .into_iter()
            .partition(|s| s.sender == addr || s.dest == addr);
        self.subscriptions = kept;
        for sub in gone {
            self.announce_subscription(false, &sub, now);
        }
    }

    fn set_port_info(&mut self, client: ClientId, info: &PortInfo, now: Instant) -> KernelResult<()> {
        let addr = Address::new(
            client,
            info.port
                .ok_or_else(|| KernelError::InvalidArgument("port is not attached".into()))?,
        );
        if info.client != client {
            return Err(KernelError::PermissionDenied(format!(
                "port {}:{} belongs to another client",
                info.client, addr.port
            )));
        }
        let port = self
            .own_mut(client)?
            .ports
            .get_mut(&addr.port)
            .ok_or(KernelError::NoSuchPort(addr))?;
        port.name = info.name.clone();
        port.capability = info.capability;
        port.port_type = info.port_type;
        port.midi_channels = info.midi_channels;
        port.midi_voices = info.midi_voices;
        port.synth_voices = info.synth_voices;
        port.timestamping = info.timestamping;
        self.announce(kind::PORT_CHANGE, &[addr.client, addr.port], now);
        Ok(())
    }

    fn subscribe(&mut self, client: ClientId, sub: &Subscription, now: Instant) -> KernelResult<()> {
        let sender = self.port(sub.sender)?;
        if sub.sender.client != client && !sender.capability.contains(PortCapability::READABLE) {
            return Err(KernelError::PermissionDenied(format!(
                "port {} cannot be read by subscription",
                sub.sender
            )));
        }
        let dest = self.port(sub.dest)?;
        if sub.dest.client != client && !dest.capability.contains(PortCapability::WRITABLE) {
            return Err(KernelError::PermissionDenied(format!(
                "port {} cannot be written by subscription",
                sub.dest
            )));
        }
        if let (true, Some(queue)) = (sub.time_update, sub.queue) {
            self.queue(queue)?;
        }

        let existing = self.subscribers(sub.sender, SubscriberDirection::Read);
        if existing.iter().any(|s| s.dest == sub.dest) {
            return Err(KernelError::Busy(format!(
                "{} -> {} already subscribed",
                sub.sender, sub.dest
            )));
        }
        if !existing.is_empty() && (sub.exclusive || existing.iter().any(|s| s.exclusive)) {
            return Err(KernelError::Busy(format!(
                "port {} has an exclusive connection",
                sub.sender
            )));
        }

        self.subscriptions.push(*sub);
        self.announce_subscription(true, sub, now);
        Ok(())
    }

    fn unsubscribe(&mut self, sender: Address, dest: Address, now: Instant) -> KernelResult<()> {
        let index = self
            .subscriptions
            .iter()
            .position(|s| s.sender == sender && s.dest == dest)
            .ok_or(KernelError::NotSubscribed { sender, dest })?;
        let sub = self.subscriptions.remove(index);
        self.announce_subscription(false, &sub, now);
        Ok(())
    }

    // ==================== Clients ====================

    fn open_client(&mut self, mode: OpenMode, blocking: bool, now: Instant) -> KernelResult<ClientId> {
        let client = (FIRST_USER_CLIENT..=LAST_USER_CLIENT)
            .find(|id| !self.clients.contains_key(id))
            .ok_or_else(|| KernelError::NoSpace("client table full".into()))?;
        let info = ClientInfo::new(client, format!("Client-{}", client));
        self.clients
            .insert(client, ClientSlot::new(info, mode, blocking));
        self.announce(kind::CLIENT_START, &[client], now);
        Ok(client)
    }

    fn close_client(&mut self, client: ClientId, now: Instant) {
        let Some(slot) = self.clients.remove(&client) else {
            return;
        };
        for port in slot.ports.keys() {
            let addr = Address::new(client, *port);
            self.drop_port_subscriptions(addr, now);
            self.announce(kind::PORT_EXIT, &[client, *port], now);
        }

        let owned: Vec<QueueId> = self
            .queues
            .values()
            .filter(|q| q.info.owner == client)
            .map(|q| q.info.queue)
            .collect();
        for queue in owned {
            if let Some(slot) = self.queues.remove(&queue) {
                let pending = slot
                    .by_tick
                    .into_iter()
                    .chain(slot.by_time)
                    .map(|Reverse(p)| p)
                    .collect();
                self.release(pending);
            }
        }
        for queue in self.queues.values_mut() {
            queue.remove_where(|p| p.owner == client);
        }

        self.announce(kind::CLIENT_EXIT, &[client], now);
        tracing::debug!("Virtual client {} closed", client);
    }

    fn set_client_info(&mut self, client: ClientId, info: &ClientInfo, now: Instant) -> KernelResult<()> {
        if info.client != client {
            return Err(KernelError::PermissionDenied(format!(
                "cannot modify client {}",
                info.client
            )));
        }
        let slot = self.own_mut(client)?;
        slot.info.name = info.name.clone();
        slot.info.broadcast_filter = info.broadcast_filter;
        slot.info.error_bounce = info.error_bounce;
        slot.info.event_filter = info.event_filter.clone();
        self.announce(kind::CLIENT_CHANGE, &[client], now);
        Ok(())
    }

    // ==================== Queues ====================

    fn check_queue_access(&self, client: ClientId, queue: QueueId) -> KernelResult<&QueueSlot> {
        let slot = self.queue(queue)?;
        if slot.info.locked && slot.info.owner != client {
            return Err(KernelError::PermissionDenied(format!(
                "queue {} is locked by client {}",
                queue, slot.info.owner
            )));
        }
        Ok(slot)
    }

    fn check_queue_owner(&self, client: ClientId, queue: QueueId) -> KernelResult<&QueueSlot> {
        let slot = self.queue(queue)?;
        if slot.info.owner != client {
            return Err(KernelError::PermissionDenied(format!(
                "queue {} is owned by client {}",
                queue, slot.info.owner
            )));
        }
        Ok(slot)
    }

    fn alloc_queue(&mut self, client: ClientId, name: &str, now: Instant) -> KernelResult<QueueInfo> {
        self.own(client)?;
        let queue = (0..MAX_QUEUES)
            .find(|q| !self.queues.contains_key(q))
            .ok_or_else(|| KernelError::NoSpace("queue table full".into()))?;
        let slot = QueueSlot::new(queue, name, client, now);
        let info = slot.info.clone();
        self.queues.insert(queue, slot);
        Ok(info)
    }

    fn free_queue(&mut self, client: ClientId, queue: QueueId) -> KernelResult<()> {
        self.check_queue_owner(client, queue)?;
        if let Some(mut slot) = self.queues.remove(&queue) {
            let pending = slot.remove_where(|_| true);
            self.release(pending);
        }
        Ok(())
    }
}

// ==================== Bus ====================

struct Bus {
    state: Mutex<BusState>,
    input_ready: Condvar,
    output_ready: Condvar,
}

impl Bus {
    /// Runs `f` on the current bus state, delivering due events before and after.
    fn with<R>(&self, f: impl FnOnce(&mut BusState, Instant) -> R) -> R {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.advance(now);
        let result = f(&mut state, now);
        state.advance(Instant::now());
        drop(state);
        self.input_ready.notify_all();
        self.output_ready.notify_all();
        result
    }

    fn wait_until(
        &self,
        timeout: Duration,
        ready_on: &Condvar,
        mut ready: impl FnMut(&BusState) -> KernelResult<bool>,
    ) -> KernelResult<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            if state.advance(now) {
                self.input_ready.notify_all();
                self.output_ready.notify_all();
            }
            if ready(&state)? {
                return Ok(true);
            }
            let mut wait = match deadline {
                Some(deadline) if now >= deadline => return Ok(false),
                Some(deadline) => deadline - now,
                None => Duration::from_secs(1),
            };
            if let Some(next) = state.next_deadline(now) {
                wait = wait.min(next.max(MIN_WAIT));
            }
            ready_on.wait_for(&mut state, wait);
        }
    }
}

/// An in-process sequencer bus. Cloning shares the bus.
#[derive(Clone)]
pub struct VirtualSequencer {
    bus: Arc<Bus>,
}

impl Default for VirtualSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualSequencer {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Bus {
                state: Mutex::new(BusState::new()),
                input_ready: Condvar::new(),
                output_ready: Condvar::new(),
            }),
        }
    }

    /// Ids of the clients currently on the bus, system client included.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.bus.state.lock().clients.keys().copied().collect()
    }
}

impl SequencerBackend for VirtualSequencer {
    fn open(
        &self,
        device: &str,
        mode: OpenMode,
        blocking: bool,
    ) -> KernelResult<Arc<dyn SequencerHandle>> {
        if !DEVICES.contains(&device) {
            return Err(KernelError::NoDevice(device.to_string()));
        }
        let client = self
            .bus
            .with(|state, now| state.open_client(mode, blocking, now))?;
        tracing::debug!("Virtual client {} opened on '{}'", client, device);
        Ok(Arc::new(VirtualHandle {
            bus: Arc::clone(&self.bus),
            client,
        }))
    }
}

struct VirtualHandle {
    bus: Arc<Bus>,
    client: ClientId,
}

impl Drop for VirtualHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn record_matches(record: &RawRecord, criteria: &RemoveCriteria) -> bool {
    codec::decode(record)
        .map(|event| criteria.matches(&event))
        .unwrap_or(false)
}

impl SequencerHandle for VirtualHandle {
    fn client_id(&self) -> ClientId {
        self.client
    }

    fn is_open(&self) -> bool {
        self.bus.state.lock().clients.contains_key(&self.client)
    }

    fn close(&self) {
        let client = self.client;
        self.bus.with(|state, now| state.close_client(client, now));
    }

    fn set_blocking(&self, blocking: bool) -> KernelResult<()> {
        self.bus.with(|state, _| {
            state.own_mut(self.client)?.blocking = blocking;
            Ok(())
        })
    }

    fn client_info(&self, client: ClientId) -> KernelResult<ClientInfo> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            state.client_snapshot(client)
        })
    }

    fn set_client_info(&self, info: &ClientInfo) -> KernelResult<()> {
        self.bus
            .with(|state, now| state.set_client_info(self.client, info, now))
    }

    fn next_client(&self, after: Option<ClientId>) -> KernelResult<Option<ClientInfo>> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
            match state.clients.range((lower, Bound::Unbounded)).next() {
                Some((id, _)) => state.client_snapshot(*id).map(Some),
                None => Ok(None),
            }
        })
    }

    fn next_port(&self, client: ClientId, after: Option<PortId>) -> KernelResult<Option<PortInfo>> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            let slot = state
                .clients
                .get(&client)
                .ok_or(KernelError::NoSuchClient(client))?;
            let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
            match slot.ports.range((lower, Bound::Unbounded)).next() {
                Some((port, _)) => state.port_snapshot(Address::new(client, *port)).map(Some),
                None => Ok(None),
            }
        })
    }

    fn create_port(&self, info: &PortInfo) -> KernelResult<PortInfo> {
        self.bus
            .with(|state, now| state.create_port(self.client, info, now))
    }

    fn delete_port(&self, port: Address) -> KernelResult<()> {
        self.bus
            .with(|state, now| state.delete_port(self.client, port, now))
    }

    fn port_info(&self, port: Address) -> KernelResult<PortInfo> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            state.port_snapshot(port)
        })
    }

    fn set_port_info(&self, info: &PortInfo) -> KernelResult<()> {
        self.bus
            .with(|state, now| state.set_port_info(self.client, info, now))
    }

    fn subscribe(&self, subscription: &Subscription) -> KernelResult<()> {
        self.bus.with(|state, now| {
            state.own(self.client)?;
            state.subscribe(self.client, subscription, now)
        })
    }

    fn unsubscribe(&self, sender: Address, dest: Address) -> KernelResult<()> {
        self.bus.with(|state, now| {
            state.own(self.client)?;
            state.unsubscribe(sender, dest, now)
        })
    }

    fn query_subscribers(
        &self,
        port: Address,
        direction: SubscriberDirection,
    ) -> KernelResult<Vec<Subscription>> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            state.port(port)?;
            Ok(state.subscribers(port, direction))
        })
    }

    fn alloc_queue(&self, name: &str) -> KernelResult<QueueInfo> {
        self.bus
            .with(|state, now| state.alloc_queue(self.client, name, now))
    }

    fn free_queue(&self, queue: QueueId) -> KernelResult<()> {
        self.bus.with(|state, _| state.free_queue(self.client, queue))
    }

    fn queue_by_name(&self, name: &str) -> KernelResult<QueueInfo> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            state
                .queues
                .values()
                .find(|q| q.info.name == name)
                .map(|q| q.info.clone())
                .ok_or_else(|| KernelError::NoSuchQueueName(name.to_string()))
        })
    }

    fn queue_info(&self, queue: QueueId) -> KernelResult<QueueInfo> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            Ok(state.queue(queue)?.info.clone())
        })
    }

    fn set_queue_info(&self, info: &QueueInfo) -> KernelResult<()> {
        self.bus.with(|state, _| {
            state.check_queue_owner(self.client, info.queue)?;
            let slot = state.queue_mut(info.queue)?;
            slot.info.name = info.name.clone();
            slot.info.locked = info.locked;
            slot.info.owner = info.owner;
            Ok(())
        })
    }

    fn queue_status(&self, queue: QueueId) -> KernelResult<QueueStatus> {
        self.bus.with(|state, now| {
            state.own(self.client)?;
            let slot = state.queue(queue)?;
            let (tick, nanos) = slot.position(now);
            Ok(QueueStatus {
                queue,
                running: slot.running,
                events: slot.events(),
                tick: tick.floor().min(u32::MAX as f64) as u32,
                time: RealTime::from(Duration::from_nanos(nanos)),
            })
        })
    }

    fn queue_tempo(&self, queue: QueueId) -> KernelResult<QueueTempo> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            Ok(state.queue(queue)?.tempo)
        })
    }

    fn set_queue_tempo(&self, tempo: &QueueTempo) -> KernelResult<()> {
        self.bus.with(|state, now| {
            let slot = state.check_queue_access(self.client, tempo.queue)?;
            if tempo.usec_per_beat == 0 || tempo.skew_base == 0 || tempo.ppq == 0 {
                return Err(KernelError::InvalidArgument(
                    "tempo, ppq and skew base must be non-zero".into(),
                ));
            }
            if slot.running && tempo.ppq != slot.tempo.ppq {
                return Err(KernelError::Busy(
                    "cannot change ppq of a running queue".into(),
                ));
            }
            state.queue_mut(tempo.queue)?.set_tempo(now, *tempo);
            Ok(())
        })
    }

    fn queue_timer(&self, queue: QueueId) -> KernelResult<QueueTimer> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            Ok(state.queue(queue)?.timer)
        })
    }

    fn set_queue_timer(&self, timer: &QueueTimer) -> KernelResult<()> {
        self.bus.with(|state, _| {
            if state.check_queue_owner(self.client, timer.queue)?.running {
                return Err(KernelError::Busy(
                    "cannot change the timer of a running queue".into(),
                ));
            }
            state.queue_mut(timer.queue)?.timer = *timer;
            Ok(())
        })
    }

    fn write(&self, records: &[RawRecord]) -> KernelResult<usize> {
        self.bus
            .with(|state, now| state.write(self.client, records, now))
    }

    fn read(&self) -> KernelResult<Option<RawRecord>> {
        self.bus.with(|state, _| {
            let slot = state.own_mut(self.client)?;
            if !slot.mode.can_read() {
                return Err(KernelError::PermissionDenied(
                    "client was opened without input".into(),
                ));
            }
            Ok(slot.input.pop_front())
        })
    }

    fn input_pending(&self) -> KernelResult<usize> {
        self.bus
            .with(|state, _| Ok(state.own(self.client)?.input.len()))
    }

    fn poll_input(&self, timeout: Duration) -> KernelResult<bool> {
        let client = self.client;
        self.bus.wait_until(timeout, &self.bus.input_ready, |state| {
            Ok(!state.own(client)?.input.is_empty())
        })
    }

    fn poll_output(&self, timeout: Duration) -> KernelResult<bool> {
        let client = self.client;
        self.bus.wait_until(timeout, &self.bus.output_ready, |state| {
            Ok(state.own(client)?.output_writable())
        })
    }

    fn remove_events(&self, criteria: &RemoveCriteria) -> KernelResult<usize> {
        self.bus.with(|state, _| {
            let mut removed = 0;
            if criteria.input {
                let slot = state.own_mut(self.client)?;
                let before = slot.input.len();
                slot.input.retain(|r| !record_matches(r, criteria));
                removed += before - slot.input.len();
            }
            if criteria.output {
                state.own(self.client)?;
                removed += state
                    .remove_output(self.client, &|r: &RawRecord| record_matches(r, criteria));
            }
            Ok(removed)
        })
    }

    fn drop_input(&self) -> KernelResult<()> {
        self.bus.with(|state, _| {
            state.own_mut(self.client)?.input.clear();
            Ok(())
        })
    }

    fn drop_input_buffer(&self) -> KernelResult<()> {
        self.drop_input()
    }

    fn drop_output(&self) -> KernelResult<()> {
        self.bus.with(|state, _| {
            state.own(self.client)?;
            state.remove_output(self.client, &|_: &RawRecord| true);
            Ok(())
        })
    }

    fn output_buffer_size(&self) -> KernelResult<usize> {
        self.bus
            .with(|state, _| Ok(state.own(self.client)?.output_buffer))
    }

    fn set_output_buffer_size(&self, bytes: usize) -> KernelResult<()> {
        if bytes < RECORD_HEADER_SIZE {
            return Err(KernelError::InvalidArgument(format!(
                "output buffer of {} bytes cannot hold a record",
                bytes
            )));
        }
        self.bus.with(|state, _| {
            state.own_mut(self.client)?.output_buffer = bytes;
            Ok(())
        })
    }

    fn input_buffer_size(&self) -> KernelResult<usize> {
        self.bus
            .with(|state, _| Ok(state.own(self.client)?.input_buffer))
    }

    fn set_input_buffer_size(&self, bytes: usize) -> KernelResult<()> {
        if bytes < RECORD_HEADER_SIZE {
            return Err(KernelError::InvalidArgument(format!(
                "input buffer of {} bytes cannot hold a record",
                bytes
            )));
        }
        self.bus.with(|state, _| {
            state.own_mut(self.client)?.input_buffer = bytes;
            Ok(())
        })
    }

    fn pool_info(&self) -> KernelResult<PoolInfo> {
        self.bus
            .with(|state, _| Ok(state.own(self.client)?.pool_snapshot()))
    }

    fn set_pool_info(&self, pool: &PoolInfo) -> KernelResult<()> {
        if pool.output_pool == 0 || pool.input_pool == 0 {
            return Err(KernelError::InvalidArgument("pool sizes must be non-zero".into()));
        }
        if pool.output_room > pool.output_pool {
            return Err(KernelError::InvalidArgument(
                "output room exceeds the output pool".into(),
            ));
        }
        self.bus.with(|state, _| {
            let slot = state.own_mut(self.client)?;
            slot.pool.output_pool = pool.output_pool;
            slot.pool.input_pool = pool.input_pool;
            slot.pool.output_room = pool.output_room;
            Ok(())
        })
    }

    fn reset_pool_input(&self) -> KernelResult<()> {
        self.drop_input()
    }

    fn reset_pool_output(&self) -> KernelResult<()> {
        self.drop_output()
    }
}
