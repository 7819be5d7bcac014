//! Oxibot Core — shared types, the pub/sub message bus, conversation
//! history storage, configuration, and small time/path utilities used
//! by every other Oxibot crate.

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod session;
pub mod timezone;
pub mod types;
pub mod utils;

pub use types::{AgentResult, FinishReason, Message, ToolCall, ToolDefinition};
