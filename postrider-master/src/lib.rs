//! The master supervisor: a long-running registry of services that spawns,
//! rate-limits, and reaps worker processes under per-service concurrency
//! caps, and owns the flow-control token pipe.

pub mod error;
pub mod sample;
pub mod service;
pub mod spawn;
pub mod supervisor;

pub use error::MasterError;
pub use service::{Endpoint, ProcessKind, ServiceConfig};
pub use supervisor::{Master, MasterCommand};
