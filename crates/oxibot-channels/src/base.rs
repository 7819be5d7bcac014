//! The seam every chat surface (Telegram, Discord, a test harness, …)
//! plugs into. `ChannelManager` only ever talks to `dyn Channel`, so
//! adding a new surface means implementing this trait, nothing more.

use async_trait::async_trait;
use oxibot_core::bus::types::OutboundMessage;

/// A connected chat surface: something that can receive messages from the
/// outside world and deliver replies back to it.
///
/// `ChannelManager` holds one `Box<dyn Channel>` per configured surface and
/// drives all of them through the same start/stop/send lifecycle.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Identifier matching the config key and `OutboundMessage.channel`
    /// (e.g. `"telegram"`, `"discord"`, `"test"`).
    fn name(&self) -> &str;

    /// Begin listening for incoming messages.
    ///
    /// Long-running: publishes `InboundMessage`s to the bus until `stop()`
    /// is called or the process shuts down.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop listening and release any held resources.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Deliver an outbound message on this surface.
    ///
    /// Invoked by the manager's outbound dispatcher once it pulls a
    /// message addressed to this channel off the bus.
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;
}


