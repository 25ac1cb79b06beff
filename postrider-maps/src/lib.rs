//! Uniform lookup over composable table backends.
//!
//! A [`Map`] answers `lookup(key)` with a value, *not found*, or a soft
//! error. Soft errors mean "try the whole operation again later" and must
//! never be collapsed into not-found by callers.

pub mod debug;
pub mod error;
pub mod inline;
pub mod map;
pub mod pipeline;
pub mod registry;
pub mod statics;
pub mod union;

pub use debug::DebugMap;
pub use error::MapError;
pub use inline::InlineMap;
pub use map::{Map, SharedMap};
pub use pipeline::PipelineMap;
pub use registry::MapRegistry;
pub use statics::StaticMap;
pub use union::UnionMap;
