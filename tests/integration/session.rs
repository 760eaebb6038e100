//! Session lifecycle and directory tests

use crate::helpers::*;
use seqbus::prelude::*;
use seqbus::{AddressError, ClientInfo};

#[test]
fn test_session_opens_with_name() {
    let bus = test_bus();
    let mut session = test_session(&bus, "T1");
    assert!(session.is_open());
    assert_eq!(session.client_name(), "T1");
    assert_eq!(session.device_name(), "default");
}

#[test]
fn test_sessions_see_each_other() {
    let bus = test_bus();
    let mut a = test_session(&bus, "alpha");
    let _b = test_session(&bus, "beta");

    let names: Vec<String> = a
        .available_clients()
        .into_iter()
        .map(|c: ClientInfo| c.name)
        .collect();
    assert!(names.contains(&"alpha".to_string()));
    assert!(names.contains(&"beta".to_string()));
}

#[test]
fn test_close_then_reopen() {
    let bus = test_bus();
    let mut session = test_session(&bus, "cycle");
    let first = session.client_id();
    session.close();
    assert!(!session.is_open());
    assert_eq!(session.client_id(), None);

    session.open_default().unwrap();
    assert!(session.is_open());
    assert_ne!(session.client_id(), first);
    assert_eq!(session.client_name(), "cycle");
}

/// Client and address errors both convert into the umbrella error.
#[test]
fn test_umbrella_error_conversion() {
    fn connect(session: &mut ClientSession, target: &str) -> Result<()> {
        let port = session.create_port(PortInfo::duplex("out"))?;
        let dest = session.resolve_address(target)?;
        session.port(&port)?.subscribe_to(dest)?;
        Ok(())
    }

    let bus = test_bus();
    let mut session = test_session(&bus, "errors");
    let _synth = test_session(&bus, "synth");

    assert!(matches!(
        connect(&mut session, "nobody:0"),
        Err(Error::Address(AddressError::ClientNotFound(_)))
    ));
    assert!(matches!(
        connect(&mut session, "synth:7"),
        Err(Error::Client(_))
    ));
}
