//! Oxibot Channels — the channel-facing half of the message bus.
//!
//! Concrete protocol adapters (Telegram, Discord, Slack, …) are out of
//! scope for this crate; it owns only the shapes every adapter plugs
//! into:
//! - **base**: the `Channel` trait every adapter implements
//! - **manager**: `ChannelManager` — lifecycle orchestration and
//!   outbound routing to registered channels
//! - **adapter**: `BusAdapter` — inbound events in, turn processor out,
//!   outbound events published per the batched/empty/error contract

pub mod adapter;
pub mod base;
pub mod manager;

pub use adapter::BusAdapter;
pub use base::Channel;
pub use manager::ChannelManager;
