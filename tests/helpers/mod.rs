//! Test helpers and fixtures for seqbus integration tests

use seqbus::prelude::*;
use seqbus::RealtimeConfig;
use std::sync::{Arc, Once};
use std::time::Duration;

/// Upper bound for anything that waits on the input pump.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// A fresh in-process bus.
pub fn test_bus() -> Arc<VirtualSequencer> {
    Arc::new(VirtualSequencer::new())
}

/// An open session with real-time elevation disabled and short pump timeouts.
pub fn test_session(bus: &Arc<VirtualSequencer>, name: &str) -> ClientSession {
    init_tracing();
    ClientSession::builder()
        .client_name(name)
        .realtime(RealtimeConfig::disabled())
        .poll_timeout(Duration::from_millis(20))
        .stop_retries(10, Duration::from_millis(20))
        .open(bus.clone())
        .expect("Failed to open test session")
}
