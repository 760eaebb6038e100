//! Queue binding and scheduling control.
//!
//! A session is bound to at most one queue, either owned (allocated by the
//! session and freed with it) or borrowed from another client.
//! [`QueueScheduler`] is a borrowed view that drives the bound queue.

use crate::error::Result;
use crate::session::ClientSession;
use seqbus_event::{
    QueueControl, QueueId, QueueInfo, QueueStatus, QueueTempo, QueueTimer, RealTime,
    SequencerEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBinding {
    #[default]
    Unbound,
    Owned(QueueId),
    Borrowed(QueueId),
}

impl QueueBinding {
    pub fn id(&self) -> Option<QueueId> {
        match self {
            QueueBinding::Unbound => None,
            QueueBinding::Owned(q) | QueueBinding::Borrowed(q) => Some(*q),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, QueueBinding::Owned(_))
    }
}

pub struct QueueScheduler<'a> {
    session: &'a mut ClientSession,
    queue: QueueId,
}

impl<'a> QueueScheduler<'a> {
    pub(crate) fn new(session: &'a mut ClientSession, queue: QueueId) -> Self {
        Self { session, queue }
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.queue
    }

    pub fn is_owned(&self) -> bool {
        self.session.queue.is_owned()
    }

    // ==================== Transport ====================

    /// Sends a control event through the output buffer, then drains it.
    fn control(&mut self, control: QueueControl) -> Result<()> {
        let handle = self.session.kernel()?;
        let event = SequencerEvent::queue_control(self.queue, control);
        let blocking = self.session.config.blocking;
        let timeout = self.session.config.output_timeout;
        self.session.output.send(&*handle, &event, blocking, timeout)?;
        self.session
            .output
            .drain(&*handle, true, Some(self.session.config.poll_timeout))?;
        Ok(())
    }

    /// Sends a control event straight to the kernel.
    fn control_direct(&mut self, control: QueueControl) -> Result<()> {
        self.session
            .send_direct(&SequencerEvent::queue_control(self.queue, control))
    }

    pub fn start(&mut self) -> Result<()> {
        tracing::debug!("Starting queue {}", self.queue);
        self.control(QueueControl::Start)
    }

    /// Does nothing once the kernel handle is gone.
    pub fn stop(&mut self) -> Result<()> {
        match self.session.handle() {
            Some(handle) if handle.is_open() => {
                tracing::debug!("Stopping queue {}", self.queue);
                self.control(QueueControl::Stop)
            }
            _ => Ok(()),
        }
    }

    pub fn continue_running(&mut self) -> Result<()> {
        self.control(QueueControl::Continue)
    }

    /// Drops every event this session has in the kernel output pool.
    pub fn clear(&mut self) -> Result<()> {
        self.session.drop_output()
    }

    pub fn set_tick_position(&mut self, tick: u32) -> Result<()> {
        self.control_direct(QueueControl::SetTickPosition(tick))
    }

    pub fn set_real_time_position(&mut self, sec: u32, nsec: u32) -> Result<()> {
        self.control_direct(QueueControl::SetTimePosition(RealTime::new(sec, nsec)))
    }

    // ==================== Tempo ====================

    pub fn tempo(&self) -> Result<QueueTempo> {
        let handle = self.session.kernel()?;
        Ok(handle.queue_tempo(self.queue)?)
    }

    pub fn set_tempo(&mut self, tempo: &QueueTempo) -> Result<()> {
        let handle = self.session.kernel()?;
        let tempo = QueueTempo {
            queue: self.queue,
            ..*tempo
        };
        Ok(handle.set_queue_tempo(&tempo)?)
    }

    fn update_tempo(&mut self, f: impl FnOnce(&mut QueueTempo)) -> Result<()> {
        let mut tempo = self.tempo()?;
        f(&mut tempo);
        self.set_tempo(&tempo)
    }

    pub fn nominal_bpm(&self) -> Result<f64> {
        Ok(self.tempo()?.nominal_bpm())
    }

    pub fn set_nominal_bpm(&mut self, bpm: f64) -> Result<()> {
        self.update_tempo(|t| t.set_nominal_bpm(bpm))
    }

    /// Nominal tempo scaled by the skew.
    pub fn real_bpm(&self) -> Result<f64> {
        Ok(self.tempo()?.real_bpm())
    }

    pub fn set_tempo_factor(&mut self, factor: f64) -> Result<()> {
        self.update_tempo(|t| t.set_tempo_factor(factor))
    }

    pub fn set_skew(&mut self, value: u32, base: u32) -> Result<()> {
        self.update_tempo(|t| {
            t.skew_value = value;
            t.skew_base = base;
        })
    }

    // ==================== Info and timer ====================

    pub fn info(&self) -> Result<QueueInfo> {
        let handle = self.session.kernel()?;
        Ok(handle.queue_info(self.queue)?)
    }

    /// Updates name and lock state. Only the owner may do this.
    pub fn set_info(&mut self, info: &QueueInfo) -> Result<()> {
        let handle = self.session.kernel()?;
        let info = QueueInfo {
            queue: self.queue,
            ..info.clone()
        };
        Ok(handle.set_queue_info(&info)?)
    }

    pub fn status(&self) -> Result<QueueStatus> {
        let handle = self.session.kernel()?;
        Ok(handle.queue_status(self.queue)?)
    }

    pub fn timer(&self) -> Result<QueueTimer> {
        let handle = self.session.kernel()?;
        Ok(handle.queue_timer(self.queue)?)
    }

    /// Only a stopped queue's timer can change.
    pub fn set_timer(&mut self, timer: &QueueTimer) -> Result<()> {
        let handle = self.session.kernel()?;
        let timer = QueueTimer {
            queue: self.queue,
            ..*timer
        };
        Ok(handle.set_queue_timer(&timer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::error::Error;
    use crate::kernel::{KernelError, VirtualSequencer};
    use approx::assert_relative_eq;
    use seqbus_event::{PortInfo, TimerSource, SKEW_BASE};
    use std::sync::Arc;

    fn session(bus: &VirtualSequencer) -> ClientSession {
        ClientSession::builder()
            .realtime(RealtimeConfig::disabled())
            .open(Arc::new(bus.clone()))
            .unwrap()
    }

    #[test]
    fn test_binding_ids() {
        assert_eq!(QueueBinding::Unbound.id(), None);
        assert_eq!(QueueBinding::Owned(3).id(), Some(3));
        assert_eq!(QueueBinding::Borrowed(4).id(), Some(4));
        assert!(QueueBinding::Owned(3).is_owned());
        assert!(!QueueBinding::Borrowed(3).is_owned());
    }

    #[test]
    fn test_nominal_bpm_sets_tempo() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        s.create_queue("Q1").unwrap();
        let mut q = s.queue().unwrap();
        q.set_nominal_bpm(120.0).unwrap();
        assert_eq!(q.tempo().unwrap().usec_per_beat, 500_000);
        assert_relative_eq!(q.nominal_bpm().unwrap(), 120.0);
    }

    #[test]
    fn test_tempo_factor_scales_real_bpm() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        s.create_queue("skewed").unwrap();
        let mut q = s.queue().unwrap();
        q.set_nominal_bpm(100.0).unwrap();
        q.set_tempo_factor(1.5).unwrap();
        assert_relative_eq!(q.real_bpm().unwrap(), 150.0, epsilon = 1e-3);

        q.set_skew(SKEW_BASE, SKEW_BASE).unwrap();
        assert_relative_eq!(q.real_bpm().unwrap(), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_start_stop_continue() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        s.create_queue("transport").unwrap();
        let mut q = s.queue().unwrap();
        assert!(!q.status().unwrap().running);
        q.start().unwrap();
        assert!(q.status().unwrap().running);
        q.stop().unwrap();
        assert!(!q.status().unwrap().running);
        q.continue_running().unwrap();
        assert!(q.status().unwrap().running);
    }

    #[test]
    fn test_stop_after_handle_closed_is_noop() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        s.create_queue("gone").unwrap();
        s.handle().unwrap().close();
        assert!(s.queue().unwrap().stop().is_ok());
    }

    #[test]
    fn test_set_tick_position() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        s.create_queue("seek").unwrap();
        let mut q = s.queue().unwrap();
        q.set_tick_position(960).unwrap();
        assert_eq!(q.status().unwrap().tick, 960);
        q.set_real_time_position(2, 0).unwrap();
        assert_eq!(q.status().unwrap().time.sec, 2);
    }

    #[test]
    fn test_clear_drops_scheduled_output() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        let port = s.create_port(PortInfo::duplex("p")).unwrap();
        let queue = s.create_queue("pending").unwrap();
        for tick in [100, 200, 300] {
            s.send(&SequencerEvent::note_on(0, 60, 1).to(port.address()).at_tick(queue, tick))
                .unwrap();
        }
        s.drain_output().unwrap();
        assert_eq!(s.queue().unwrap().status().unwrap().events, 3);

        s.queue().unwrap().clear().unwrap();
        assert_eq!(s.queue().unwrap().status().unwrap().events, 0);
        assert_eq!(s.output_pending(), 0);
    }

    #[test]
    fn test_info_and_timer() {
        let bus = VirtualSequencer::new();
        let mut s = session(&bus);
        s.create_queue("named").unwrap();
        let mut q = s.queue().unwrap();

        let mut info = q.info().unwrap();
        assert_eq!(info.name, "named");
        info.name = "renamed".into();
        info.locked = false;
        q.set_info(&info).unwrap();
        assert_eq!(q.info().unwrap().name, "renamed");
        assert!(!q.info().unwrap().locked);

        let mut timer = q.timer().unwrap();
        timer.source = TimerSource::HighResolution;
        q.set_timer(&timer).unwrap();
        assert_eq!(q.timer().unwrap().source, TimerSource::HighResolution);

        q.start().unwrap();
        assert!(matches!(
            q.set_timer(&timer),
            Err(Error::Kernel(KernelError::Busy(_)))
        ));
    }

    #[test]
    fn test_borrowed_locked_queue_refuses_tempo() {
        let bus = VirtualSequencer::new();
        let mut owner = session(&bus);
        let mut guest = session(&bus);
        owner.create_queue("locked").unwrap();
        guest.use_queue_name("locked").unwrap();

        let mut q = guest.queue().unwrap();
        assert!(!q.is_owned());
        assert!(q.tempo().is_ok());
        assert!(matches!(
            q.set_nominal_bpm(90.0),
            Err(Error::Kernel(KernelError::PermissionDenied(_)))
        ));
    }
}
