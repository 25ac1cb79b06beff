//! Queue file format and spool directory management.
//!
//! A queue file is a typed record stream: `SIZE`, envelope records, `MESG`,
//! content, `XTRA`, extracted records, `END`. The queue manager patches
//! records in place (`SIZE` totals, `DONE` markers) and relies on atomic
//! renames for every cross-queue move.

pub mod bouncelog;
pub mod error;
pub mod id;
pub mod lock;
pub mod queue;
pub mod record;
pub mod size;

pub use bouncelog::{BounceLog, LogEntry};
pub use error::SpoolError;
pub use id::QueueId;
pub use lock::{LockStrategy, QueueFileGuard};
pub use queue::{QueueDirs, QueueName};
pub use record::{Record, RecordKind, RecordReader, RecordWriter};
pub use size::SizeRecord;
