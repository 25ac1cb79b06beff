//! The cleanup pipeline: canonicalize an incoming message into an on-disk
//! queue file.
//!
//! Cleanup is record-driven: each submitted record dispatches on its type
//! within the current state. Errors accumulate in a bitmask; the final
//! disposition is computed once, when the stream ends.

pub mod error;
pub mod flags;
pub mod inspect;
pub mod notify;
pub mod state;

pub use error::CleanupError;
pub use flags::CleanupFlags;
pub use inspect::{InspectAction, Inspector};
pub use state::{Cleanup, CleanupConfig, Disposition};
