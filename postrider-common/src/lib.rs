pub mod attr;
pub mod dsn;
pub mod dup_filter;
pub mod error;
pub mod flow;
pub mod logging;
pub mod params;
pub mod ports;
pub mod recipient;
pub mod sendopts;
pub mod trigger;

pub use dsn::{Dsn, DsnAction, DsnStatus};
pub use dup_filter::DupFilter;
pub use params::{Params, Runtime};
pub use recipient::{NotifyFlags, Recipient};
pub use sendopts::SendOpts;
pub use tracing;

/// Control signal broadcast to every long-running service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting new work, drain in-flight work, then exit.
    Shutdown,
    /// Replace the runtime parameters; services re-snapshot on next operation.
    Reload,
}
