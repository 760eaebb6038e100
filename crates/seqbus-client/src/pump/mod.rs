//! Background input pump.
//!
//! One worker thread per open session waits for kernel input, decodes every
//! available record and hands it to the [`EventRouter`]. Client and port
//! announcements mark the session's directory dirty before they are
//! dispatched.
//!
//! Stopping is bounded: the worker re-checks its stop flag at least once per
//! poll timeout, and a worker that still has not signalled its exit after
//! the configured retries is abandoned rather than joined.

mod priority;
pub use priority::{
    DegradeElevator, DirectElevator, ElevationChain, PriorityElevator, RealtimeService,
    ServiceElevator, ServiceError,
};

use crate::codec;
use crate::config::{RealtimeConfig, SessionConfig};
use crate::error::Result;
use crate::kernel::{KernelError, RawRecord, SequencerHandle};
use crate::router::EventRouter;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause after a failed poll or read before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PumpState {
    #[default]
    Created = 0,
    Running = 1,
    StopRequested = 2,
    Joined = 3,
    /// The worker never signalled its exit and was detached.
    ForceTerminated = 4,
}

impl PumpState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PumpState::Running,
            2 => PumpState::StopRequested,
            3 => PumpState::Joined,
            4 => PumpState::ForceTerminated,
            _ => PumpState::Created,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    pub poll_timeout: Duration,
    pub stop_retries: u32,
    pub stop_retry_interval: Duration,
    pub realtime: RealtimeConfig,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for PumpConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            stop_retries: config.stop_retries,
            stop_retry_interval: config.stop_retry_interval,
            realtime: config.realtime,
        }
    }
}

/// Sends the exit signal when the worker unwinds or returns.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub struct EventPump {
    config: PumpConfig,
    state: Arc<AtomicU8>,
    stop_flag: Arc<RwLock<bool>>,
    exited: Option<Receiver<()>>,
    thread: Option<JoinHandle<()>>,
    elevated: Arc<AtomicBool>,
}

impl EventPump {
    pub fn new(config: PumpConfig) -> Self {
        Self {
            config,
            state: Arc::new(AtomicU8::new(PumpState::Created as u8)),
            stop_flag: Arc::new(RwLock::new(false)),
            exited: None,
            thread: None,
            elevated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> PumpState {
        PumpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PumpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == PumpState::Running
    }

    /// Whether the worker obtained real-time scheduling.
    pub fn is_elevated(&self) -> bool {
        self.elevated.load(Ordering::Acquire)
    }

    /// Spawns the worker. A running pump is left alone; a stopped one
    /// starts over with a fresh stop flag.
    pub fn start(
        &mut self,
        handle: Arc<dyn SequencerHandle>,
        router: Arc<EventRouter>,
        dirty: Arc<AtomicBool>,
        elevator: ElevationChain,
    ) -> Result<()> {
        if matches!(self.state(), PumpState::Running | PumpState::StopRequested) {
            return Ok(());
        }

        let stop_flag = Arc::new(RwLock::new(false));
        let (exit_tx, exit_rx) = bounded(1);
        let elevated = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            handle,
            router,
            dirty,
            stop_flag: Arc::clone(&stop_flag),
            poll_timeout: self.config.poll_timeout,
        };
        let realtime = self.config.realtime;
        let elevated_flag = Arc::clone(&elevated);

        let thread = thread::Builder::new()
            .name("seqbus-input".into())
            .spawn(move || {
                let _exit = ExitSignal(exit_tx);
                elevated_flag.store(elevator.elevate(&realtime), Ordering::Release);
                worker.run();
            })?;

        self.stop_flag = stop_flag;
        self.exited = Some(exit_rx);
        self.thread = Some(thread);
        self.elevated = elevated;
        self.set_state(PumpState::Running);
        tracing::debug!("Input pump started");
        Ok(())
    }

    /// Requests the worker to stop and waits a bounded time for it.
    /// Stopping a pump that is not running does nothing.
    pub fn stop(&mut self) {
        if self.state() != PumpState::Running {
            return;
        }
        *self.stop_flag.write() = true;
        self.set_state(PumpState::StopRequested);

        let exited = match &self.exited {
            Some(signal) => (0..self.config.stop_retries.max(1)).any(|_| {
                match signal.recv_timeout(self.config.stop_retry_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                    Err(RecvTimeoutError::Timeout) => false,
                }
            }),
            None => true,
        };
        self.exited = None;

        match self.thread.take() {
            Some(thread) if exited => {
                if thread.join().is_err() {
                    tracing::error!("Input pump thread panicked");
                }
                self.set_state(PumpState::Joined);
                tracing::debug!("Input pump stopped");
            }
            Some(thread) => {
                // Dropping the handle detaches the thread.
                drop(thread);
                self.set_state(PumpState::ForceTerminated);
                tracing::error!(
                    "Input pump did not exit after {} x {:?}, abandoning thread",
                    self.config.stop_retries,
                    self.config.stop_retry_interval
                );
            }
            None => self.set_state(PumpState::Joined),
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

// ==================== Worker ====================

struct Worker {
    handle: Arc<dyn SequencerHandle>,
    router: Arc<EventRouter>,
    dirty: Arc<AtomicBool>,
    stop_flag: Arc<RwLock<bool>>,
    poll_timeout: Duration,
}

enum Drained {
    Empty,
    Stop,
    Failed,
}

impl Worker {
    fn should_stop(&self) -> bool {
        *self.stop_flag.read()
    }

    fn run(&self) {
        while !self.should_stop() {
            match self.handle.poll_input(self.poll_timeout) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(KernelError::Closed) => {
                    tracing::debug!("Sequencer handle closed, input pump exiting");
                    return;
                }
                Err(e) => {
                    tracing::warn!("Input poll failed: {}", e);
                    thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            }

            match self.drain() {
                Drained::Empty => {}
                Drained::Stop => return,
                Drained::Failed => thread::sleep(ERROR_BACKOFF),
            }
        }
    }

    /// Reads and delivers every record available right now.
    fn drain(&self) -> Drained {
        loop {
            if self.should_stop() {
                return Drained::Stop;
            }
            match self.handle.read() {
                Ok(Some(record)) => self.deliver(&record),
                Ok(None) | Err(KernelError::WouldBlock) => return Drained::Empty,
                Err(KernelError::Closed) => return Drained::Stop,
                Err(e) => {
                    tracing::warn!("Input read failed: {}", e);
                    return Drained::Failed;
                }
            }
        }
    }

    fn deliver(&self, record: &RawRecord) {
        let event = match codec::decode(record) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping undecodable input record: {}", e);
                return;
            }
        };
        if event.is_directory_change() {
            self.dirty.store(true, Ordering::Release);
        }
        let router = &self.router;
        if catch_unwind(AssertUnwindSafe(|| router.dispatch(event))).is_err() {
            tracing::error!("Input event handler panicked, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{SequencerBackend, VirtualSequencer};
    use seqbus_event::{Address, OpenMode, PortInfo, SequencerEvent, Subscription};
    use std::time::Instant;

    fn quick_config() -> PumpConfig {
        PumpConfig {
            poll_timeout: Duration::from_millis(20),
            stop_retries: 5,
            stop_retry_interval: Duration::from_millis(20),
            realtime: RealtimeConfig::disabled(),
        }
    }

    struct Pair {
        _bus: VirtualSequencer,
        sender: Arc<dyn SequencerHandle>,
        receiver: Arc<dyn SequencerHandle>,
        from: Address,
    }

    fn pair() -> Pair {
        let bus = VirtualSequencer::new();
        let sender = bus.open("default", OpenMode::Duplex, false).unwrap();
        let receiver = bus.open("default", OpenMode::Duplex, false).unwrap();
        let from = sender
            .create_port(&PortInfo::duplex("out"))
            .unwrap()
            .address()
            .unwrap();
        let to = receiver
            .create_port(&PortInfo::duplex("in"))
            .unwrap()
            .address()
            .unwrap();
        receiver.subscribe(&Subscription::new(from, to)).unwrap();
        Pair {
            _bus: bus,
            sender,
            receiver,
            from,
        }
    }

    fn send_notes(pair: &Pair, notes: std::ops::Range<u8>) {
        let records: Vec<_> = notes
            .map(|n| {
                codec::encode(
                    &SequencerEvent::note_on(0, n, 100)
                        .with_source(pair.from)
                        .to_subscribers(),
                )
            })
            .collect();
        assert_eq!(pair.sender.write(&records).unwrap(), records.len());
    }

    #[test]
    fn test_pump_preserves_order() {
        let pair = pair();
        let router = Arc::new(EventRouter::new(64));
        let events = router.events();
        let mut pump = EventPump::new(quick_config());
        pump.start(
            Arc::clone(&pair.receiver),
            router,
            Arc::new(AtomicBool::new(false)),
            ElevationChain::empty(),
        )
        .unwrap();
        assert!(pump.is_running());

        send_notes(&pair, 0..32);
        let notes: Vec<u8> = (0..32)
            .map(|_| {
                let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
                match event.data {
                    seqbus_event::EventData::NoteOn { note, .. } => note,
                    other => panic!("unexpected {:?}", other),
                }
            })
            .collect();
        assert_eq!(notes, (0..32).collect::<Vec<_>>());

        pump.stop();
        assert_eq!(pump.state(), PumpState::Joined);
    }

    #[test]
    fn test_directory_change_sets_dirty() {
        let pair = pair();
        let port = pair
            .receiver
            .create_port(&PortInfo::duplex("watch"))
            .unwrap()
            .address()
            .unwrap();
        pair.receiver
            .subscribe(&Subscription::new(Address::SYSTEM_ANNOUNCE, port))
            .unwrap();
        pair.receiver.drop_input().unwrap();

        let dirty = Arc::new(AtomicBool::new(false));
        let router = Arc::new(EventRouter::new(64));
        let events = router.events();
        let mut pump = EventPump::new(quick_config());
        pump.start(
            Arc::clone(&pair.receiver),
            router,
            Arc::clone(&dirty),
            ElevationChain::empty(),
        )
        .unwrap();

        pair.sender.create_port(&PortInfo::duplex("new")).unwrap();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(event.is_port());
        assert!(dirty.load(Ordering::Acquire));
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let pair = pair();
        let router = Arc::new(EventRouter::new(64));
        let (tx, rx) = bounded(8);
        router.set_handler(Arc::new(move |event: SequencerEvent| {
            if let seqbus_event::EventData::NoteOn { note: 0, .. } = event.data {
                panic!("handler failure");
            }
            let _ = tx.send(event);
        }));

        let mut pump = EventPump::new(quick_config());
        pump.start(
            Arc::clone(&pair.receiver),
            router,
            Arc::new(AtomicBool::new(false)),
            ElevationChain::empty(),
        )
        .unwrap();

        send_notes(&pair, 0..2);
        let survivor = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            survivor.data,
            seqbus_event::EventData::NoteOn { note: 1, .. }
        ));
        assert!(pump.is_running());
    }

    #[test]
    fn test_stop_is_bounded() {
        let pair = pair();
        let router = Arc::new(EventRouter::new(64));
        let (release_tx, release_rx) = bounded::<()>(1);
        let (entered_tx, entered_rx) = bounded::<()>(1);
        router.set_handler(Arc::new(move |_event: SequencerEvent| {
            let _ = entered_tx.try_send(());
            let _ = release_rx.recv();
        }));

        let mut pump = EventPump::new(quick_config());
        pump.start(
            Arc::clone(&pair.receiver),
            router,
            Arc::new(AtomicBool::new(false)),
            ElevationChain::empty(),
        )
        .unwrap();
        send_notes(&pair, 0..1);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let started = Instant::now();
        pump.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pump.state(), PumpState::ForceTerminated);

        // Let the abandoned worker finish.
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_stop_and_restart() {
        let pair = pair();
        let router = Arc::new(EventRouter::new(64));
        let events = router.events();
        let mut pump = EventPump::new(quick_config());
        assert_eq!(pump.state(), PumpState::Created);

        pump.stop();
        assert_eq!(pump.state(), PumpState::Created);

        let dirty = Arc::new(AtomicBool::new(false));
        pump.start(
            Arc::clone(&pair.receiver),
            Arc::clone(&router),
            Arc::clone(&dirty),
            ElevationChain::empty(),
        )
        .unwrap();
        pump.stop();
        pump.stop();
        assert_eq!(pump.state(), PumpState::Joined);

        pump.start(
            Arc::clone(&pair.receiver),
            router,
            dirty,
            ElevationChain::empty(),
        )
        .unwrap();
        send_notes(&pair, 5..6);
        assert!(events.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_closed_handle_ends_worker() {
        let pair = pair();
        let mut pump = EventPump::new(quick_config());
        pump.start(
            Arc::clone(&pair.receiver),
            Arc::new(EventRouter::new(8)),
            Arc::new(AtomicBool::new(false)),
            ElevationChain::empty(),
        )
        .unwrap();
        pair.receiver.close();

        let started = Instant::now();
        pump.stop();
        assert_eq!(pump.state(), PumpState::Joined);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
