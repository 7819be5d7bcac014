//! LLM provider layer: a uniform [`traits::LlmProvider`] seam over twelve
//! OpenAI-compatible backends, plus speech-to-text for voice messages.
//!
//! [`registry`] holds the static spec per provider (keywords, env var,
//! API base, per-model quirks); [`http_provider::create_provider`] matches
//! a model name against the configured providers and builds the
//! [`http_provider::HttpProvider`] that will actually serve it.

pub mod http_provider;
pub mod registry;
pub mod traits;
pub mod transcription;

// Re-export main types for convenience
pub use http_provider::{create_provider, HttpProvider};
pub use registry::{ProviderConfig, ProviderSpec, PROVIDERS};
pub use traits::{LlmProvider, LlmRequestConfig};
pub use transcription::{GroqTranscriber, TranscriptionProvider};
