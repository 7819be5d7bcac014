//! The message bus — typed pub/sub connecting channels to the agent loop.

pub mod queue;
pub mod types;

pub use queue::{EventKind, MessageBus};
pub use types::{InboundMessage, OutboundMessage};
