//! Relay core: connection registry, EA link, reply correlation, and the
//! serialized command dispatcher.

pub mod bridge;
pub mod correlator;
pub mod dispatcher;
pub mod registry;

pub use bridge::UpstreamBridge;
pub use correlator::{CorrelatedResponse, PutOutcome, ResponseCorrelator};
pub use dispatcher::{CommandDispatcher, CommandState, DispatchWorker, QueuedCommand};
pub use registry::{ConnectionId, ConnectionInfo, ConnectionRegistry, Outbound, Role, OUTBOUND_CAPACITY};
