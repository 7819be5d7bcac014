//! Bus Adapter — sits between the message bus and a turn processor
//! (normally the Session Queue), translating `AgentResult`s back into
//! outbound events.
//!
//! Grounded on the same `tokio::select!{ bus event | shutdown }` shape as
//! `ChannelManager::dispatch_outbound`, generalized to consume inbound
//! events instead of outbound ones and to apply the batched/empty/error
//! outbound-mapping contract.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::{InboundMessage, OutboundMessage};
use oxibot_core::types::{AgentResult, FinishReason};

/// Fixed fallback text used when a turn produces no user-visible text.
const EMPTY_RESPONSE_FALLBACK: &str = "I couldn't generate a response. Please try again.";

/// Signature of the turn processor the adapter drives (normally
/// `SessionQueue::process_message`).
pub type ProcessorFn = Arc<
    dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = anyhow::Result<AgentResult>> + Send>>
        + Send
        + Sync,
>;

/// Bridges `message:inbound` events to a turn processor and republishes
/// the result as `message:outbound`.
pub struct BusAdapter {
    bus: Arc<MessageBus>,
    processor: ProcessorFn,
    shutdown: Arc<Notify>,
}

impl BusAdapter {
    pub fn new(bus: Arc<MessageBus>, processor: ProcessorFn) -> Self {
        Self {
            bus,
            processor,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Run the inbound-consume / outbound-publish loop until `stop()` is
    /// called or the bus closes.
    pub async fn run(&self) {
        info!("bus adapter started");

        let mut rx = match self.bus.subscribe_inbound() {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "bus adapter failed to subscribe to inbound");
                return;
            }
        };

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(inbound) => self.handle(inbound).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "bus adapter lagged, inbound messages dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            info!("inbound bus closed, bus adapter exiting");
                            break;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("bus adapter received shutdown signal");
                    break;
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    async fn handle(&self, inbound: InboundMessage) {
        let message_id = inbound.message_id.clone();
        let channel = inbound.channel.clone();
        let chat_id = inbound.chat_id.clone();

        debug!(channel = %channel, chat_id = %chat_id, "bus adapter processing inbound");

        let outbound = match (self.processor)(inbound).await {
            Ok(result) => Self::to_outbound(&channel, &chat_id, &message_id, &result),
            Err(e) => {
                let mut out = OutboundMessage::new(&channel, &chat_id, format!("Error: {e}"));
                out.reply_to = Some(message_id);
                out.metadata.insert("error".into(), "true".into());
                out
            }
        };

        if let Err(e) = self.bus.publish_outbound(outbound) {
            error!(error = %e, "bus adapter failed to publish outbound");
        }
    }

    fn to_outbound(
        channel: &str,
        chat_id: &str,
        message_id: &str,
        result: &AgentResult,
    ) -> OutboundMessage {
        if matches!(result.finish_reason, FinishReason::Batched) {
            let mut out = OutboundMessage::new(channel, chat_id, "");
            out.metadata.insert("batched".into(), "true".into());
            return out;
        }

        if result.text.trim().is_empty() {
            let mut out = OutboundMessage::new(channel, chat_id, EMPTY_RESPONSE_FALLBACK);
            out.reply_to = Some(message_id.to_string());
            return out;
        }

        let mut out = OutboundMessage::new(channel, chat_id, result.text.trim());
        out.reply_to = Some(message_id.to_string());
        out
    }
}
