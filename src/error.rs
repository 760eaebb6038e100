//! Centralized error type for the seqbus umbrella crate.
//!
//! Wraps the subsystem errors so `?` propagates across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] seqbus_client::Error),

    #[error("Kernel: {0}")]
    Kernel(#[from] seqbus_client::KernelError),

    #[error("Address: {0}")]
    Address(#[from] seqbus_event::AddressError),

    #[error("Decode: {0}")]
    Decode(#[from] seqbus_client::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
