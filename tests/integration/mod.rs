//! Integration test modules for seqbus
//!
//! - session: lifecycle, identity, directory lookups
//! - routing: port-to-port delivery and queue scheduling

pub mod routing;
pub mod session;
