//! The queue manager: scans queues, resolves recipients, enforces
//! per-destination concurrency, dispatches delivery requests, and decides
//! each message's fate from the per-recipient results.

pub mod agent;
pub mod backoff;
pub mod destination;
pub mod envelope;
pub mod error;
pub mod ops;
pub mod request;
pub mod scheduler;

pub use agent::{AgentConnector, AgentError, AgentServer, DeliveryAgent, SocketConnector};
pub use destination::{DestKey, DestinationTable};
pub use envelope::MessageEnvelope;
pub use error::QmgrError;
pub use request::{DeliveryReply, DeliveryRequest, RecipientStatus, RecipientVerdict};
pub use scheduler::QueueManager;
