//! Message tool — lets the agent reach out on its own, outside the
//! normal request/reply turn (e.g. from a sub-agent or a cron job that
//! wants to report back mid-task).
//!
//! The agent loop wires this tool's send callback to the shared message
//! bus, so a send here takes the same `OutboundMessage` path a channel
//! reply does.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use oxibot_core::bus::types::OutboundMessage;

use super::base::{optional_string, require_string, Tool};

/// Callback type for sending outbound messages.
pub type SendCallback = Arc<dyn Fn(OutboundMessage) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

// ─────────────────────────────────────────────
// MessageTool
// ─────────────────────────────────────────────

/// Allows the agent to send messages to channels.
///
/// The agent loop calls `set_context` before each interaction to set
/// the default channel/chat_id for the current conversation.
pub struct MessageTool {
    send_callback: Option<SendCallback>,
    /// Where an unadorned send lands: the channel/chat_id of whichever
    /// conversation is currently in flight.
    default_route: Mutex<(String, String)>,
}

impl MessageTool {
    /// Create a new message tool with a send callback.
    pub fn new(send_callback: Option<SendCallback>) -> Self {
        Self {
            send_callback,
            default_route: Mutex::new(("cli".into(), "direct".into())),
        }
    }

    /// Point the default route at the conversation the agent loop is
    /// currently handling.
    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        *self.default_route.lock().await = (channel.to_string(), chat_id.to_string());
    }

    /// An explicit `channel`/`chat_id` param wins over the default route.
    async fn resolve_route(&self, params: &HashMap<String, Value>) -> (String, String) {
        let default_route = self.default_route.lock().await.clone();
        (
            optional_string(params, "channel").unwrap_or(default_route.0),
            optional_string(params, "chat_id").unwrap_or(default_route.1),
        )
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to a channel. By default sends to the current conversation. \
         Can optionally specify a different channel and chat_id to send to."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message content to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Target channel (optional, defaults to current)"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Target chat ID (optional, defaults to current)"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let content = require_string(&params, "content")?;
        let (channel, chat_id) = self.resolve_route(&params).await;

        debug!(channel = %channel, chat_id = %chat_id, "sending message via tool");
        let msg = OutboundMessage::new(&channel, &chat_id, &content);

        match &self.send_callback {
            Some(cb) => cb(msg).await.map_err(|e| anyhow::anyhow!("Failed to send message: {e}"))?,
            None => debug!("no send callback configured; message discarded"),
        }

        Ok(format!("Message sent to {channel}:{chat_id}"))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────


