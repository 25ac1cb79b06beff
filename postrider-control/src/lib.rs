//! The administrative control channel.
//!
//! Requests and responses are attribute lists over a unix stream socket,
//! the same wire format as every other local interface.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::ControlError;
pub use protocol::{Command, Request, Response};
pub use server::{ControlHandler, ControlServer};
