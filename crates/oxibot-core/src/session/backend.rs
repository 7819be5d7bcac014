//! The `HistoryBackend` contract shared by the in-memory and persistent
//! conversation history stores, plus the in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::Message;

/// Storage contract for a conversation history. Implementations are
/// responsible only for durability and ordering; sanitization and trim
/// policy (see [`super::sanitize`]) are applied by callers on the
/// snapshot returned from `get_messages`.
pub trait HistoryBackend: Send + Sync {
    /// Append a message to the given session's history.
    fn add_message(&self, key: &str, message: Message);
    /// Full, ordered snapshot of a session's raw history (unsanitized).
    fn get_messages(&self, key: &str) -> Vec<Message>;
    /// Replace a session's entire message list (used by trim/summarize).
    fn replace(&self, key: &str, messages: Vec<Message>);
    /// Drop all messages for a session.
    fn clear(&self, key: &str);
    /// Number of messages currently stored for a session.
    fn len(&self, key: &str) -> usize {
        self.get_messages(key).len()
    }
    fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}

/// Ephemeral, process-local history backend. Used for tests and for
/// deployments that don't need history to survive a restart.
#[derive(Default)]
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryBackend for InMemoryHistory {
    fn add_message(&self, key: &str, message: Message) {
        self.sessions
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(message);
    }

    fn get_messages(&self, key: &str) -> Vec<Message> {
        self.sessions
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn replace(&self, key: &str, messages: Vec<Message>) {
        self.sessions
            .write()
            .unwrap()
            .insert(key.to_string(), messages);
    }

    fn clear(&self, key: &str) {
        self.sessions.write().unwrap().remove(key);
    }
}
