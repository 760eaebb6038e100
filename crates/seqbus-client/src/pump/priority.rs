//! Real-time elevation of the input pump thread.
//!
//! Elevation runs on the pump thread itself, through a chain of strategies
//! tried in order until one succeeds. A chain that ends without success
//! leaves the thread at normal priority; startup never fails on it.

use crate::config::RealtimeConfig;
use std::sync::Arc;
use thiserror::Error;

pub trait PriorityElevator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Elevates the calling thread. Returns `true` on success.
    fn elevate(&self, config: &RealtimeConfig) -> bool;
}

// ==================== Direct ====================

/// Asks the OS scheduler directly for FIFO scheduling.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectElevator;

impl PriorityElevator for DirectElevator {
    fn name(&self) -> &'static str {
        "direct"
    }

    #[cfg(unix)]
    fn elevate(&self, config: &RealtimeConfig) -> bool {
        use thread_priority::{
            RealtimeThreadSchedulePolicy, ThreadPriority, ThreadPriorityValue,
            ThreadSchedulePolicy,
        };

        let priority = ThreadPriorityValue::try_from(config.priority)
            .map(ThreadPriority::Crossplatform)
            .unwrap_or(ThreadPriority::Max);
        match thread_priority::set_thread_priority_and_policy(
            thread_priority::thread_native_id(),
            priority,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Direct real-time scheduling refused: {:?}", e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn elevate(&self, _config: &RealtimeConfig) -> bool {
        thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max).is_ok()
    }
}

// ==================== Helper service ====================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("real-time service: {0}")]
pub struct ServiceError(pub String);

/// A privileged helper that grants real-time scheduling to other
/// processes' threads over IPC.
pub trait RealtimeService: Send + Sync {
    fn make_thread_realtime(&self, thread_id: u64, priority: u8) -> Result<(), ServiceError>;
}

/// Elevates through a [`RealtimeService`]. The helper only grants requests
/// from processes that bound their real-time CPU usage, so the configured
/// budget is installed as `RLIMIT_RTTIME` first.
pub struct ServiceElevator {
    service: Arc<dyn RealtimeService>,
}

impl ServiceElevator {
    pub fn new(service: Arc<dyn RealtimeService>) -> Self {
        Self { service }
    }
}

impl PriorityElevator for ServiceElevator {
    fn name(&self) -> &'static str {
        "service"
    }

    fn elevate(&self, config: &RealtimeConfig) -> bool {
        let Some(thread_id) = current_thread_id() else {
            tracing::debug!("No kernel thread id on this platform, skipping real-time service");
            return false;
        };
        limit_rt_time(config);
        match self.service.make_thread_realtime(thread_id, config.priority) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Real-time service refused thread {}: {}", thread_id, e);
                false
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> Option<u64> {
    // SAFETY: gettid has no preconditions and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    u64::try_from(tid).ok()
}

#[cfg(not(target_os = "linux"))]
fn current_thread_id() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn limit_rt_time(config: &RealtimeConfig) {
    let micros = libc::rlim_t::try_from(config.budget.as_micros()).unwrap_or(libc::RLIM_INFINITY);
    let limit = libc::rlimit {
        rlim_cur: micros,
        rlim_max: micros,
    };
    // SAFETY: `limit` is a valid rlimit that outlives the call.
    if unsafe { libc::setrlimit(libc::RLIMIT_RTTIME, &limit) } != 0 {
        tracing::debug!(
            "Cannot set RLIMIT_RTTIME: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn limit_rt_time(_config: &RealtimeConfig) {}

// ==================== Degrade ====================

/// Last resort: keep normal scheduling and say so.
#[derive(Debug, Clone, Copy, Default)]
pub struct DegradeElevator;

impl PriorityElevator for DegradeElevator {
    fn name(&self) -> &'static str {
        "degrade"
    }

    fn elevate(&self, config: &RealtimeConfig) -> bool {
        tracing::warn!(
            "Real-time priority {} unavailable, input pump runs with normal scheduling",
            config.priority
        );
        false
    }
}

// ==================== Chain ====================

#[derive(Clone)]
pub struct ElevationChain {
    elevators: Vec<Arc<dyn PriorityElevator>>,
}

impl Default for ElevationChain {
    fn default() -> Self {
        Self::standard(None)
    }
}

impl ElevationChain {
    /// A chain with no strategies.
    pub fn empty() -> Self {
        Self {
            elevators: Vec::new(),
        }
    }

    /// Direct scheduling, then the helper service when one is given, then degrade.
    pub fn standard(service: Option<Arc<dyn RealtimeService>>) -> Self {
        let mut chain = Self::empty().with(Arc::new(DirectElevator));
        if let Some(service) = service {
            chain = chain.with(Arc::new(ServiceElevator::new(service)));
        }
        chain.with(Arc::new(DegradeElevator))
    }

    pub fn with(mut self, elevator: Arc<dyn PriorityElevator>) -> Self {
        self.elevators.push(elevator);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.elevators.iter().map(|e| e.name()).collect()
    }

    /// Tries each strategy in order on the calling thread.
    pub fn elevate(&self, config: &RealtimeConfig) -> bool {
        if !config.enabled {
            return false;
        }
        for elevator in &self.elevators {
            if elevator.elevate(config) {
                tracing::debug!("Input pump elevated via {} strategy", elevator.name());
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Fixed {
        name: &'static str,
        result: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl PriorityElevator for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn elevate(&self, _config: &RealtimeConfig) -> bool {
            self.calls.lock().push(self.name);
            self.result
        }
    }

    fn fixed(
        name: &'static str,
        result: bool,
        calls: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn PriorityElevator> {
        Arc::new(Fixed {
            name,
            result,
            calls: Arc::clone(calls),
        })
    }

    #[test]
    fn test_chain_stops_at_first_success() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ElevationChain::empty()
            .with(fixed("a", false, &calls))
            .with(fixed("b", true, &calls))
            .with(fixed("c", true, &calls));
        assert!(chain.elevate(&RealtimeConfig::default()));
        assert_eq!(*calls.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_disabled_config_skips_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ElevationChain::empty().with(fixed("a", true, &calls));
        assert!(!chain.elevate(&RealtimeConfig::disabled()));
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_degrade_never_succeeds() {
        assert!(!DegradeElevator.elevate(&RealtimeConfig::default()));
        let chain = ElevationChain::empty().with(Arc::new(DegradeElevator));
        assert!(!chain.elevate(&RealtimeConfig::default()));
    }

    #[test]
    fn test_standard_chain_order() {
        assert_eq!(ElevationChain::default().names(), vec!["direct", "degrade"]);

        struct Refuse;
        impl RealtimeService for Refuse {
            fn make_thread_realtime(&self, _: u64, _: u8) -> Result<(), ServiceError> {
                Err(ServiceError("not authorized".into()))
            }
        }
        let chain = ElevationChain::standard(Some(Arc::new(Refuse)));
        assert_eq!(chain.names(), vec!["direct", "service", "degrade"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_service_receives_thread_id() {
        struct Record(Mutex<Option<(u64, u8)>>);
        impl RealtimeService for Record {
            fn make_thread_realtime(&self, thread_id: u64, priority: u8) -> Result<(), ServiceError> {
                *self.0.lock() = Some((thread_id, priority));
                Ok(())
            }
        }

        let service = Arc::new(Record(Mutex::new(None)));
        let elevator = ServiceElevator::new(service.clone());
        // Off the test thread so the reported tid is a worker's.
        let elevated = std::thread::spawn(move || {
            elevator.elevate(&RealtimeConfig {
                priority: 42,
                budget: std::time::Duration::from_secs(10),
                ..Default::default()
            })
        })
        .join()
        .unwrap();
        assert!(elevated);
        let (tid, priority) = service.0.lock().unwrap();
        assert_ne!(tid, 0);
        assert_eq!(priority, 42);
    }
}
