//! Conversation History Store — two backends (in-memory, JSONL-persisted)
//! behind one `HistoryBackend` contract, plus the pure sanitize/trim
//! functions applied before every LLM call.

pub mod backend;
pub mod manager;
pub mod sanitize;

pub use backend::{HistoryBackend, InMemoryHistory};
pub use manager::SessionManager;
