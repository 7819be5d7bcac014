//! Session Queue — per-session debounced batcher sitting in front of the
//! Agent Loop.
//!
//! Users commonly send 2-4 rapid short messages that should be answered
//! as one turn. Each session (`channel:chatId`) gets its own pending
//! buffer and debounce timer; when the timer fires the buffer is merged
//! into a single `InboundMessage` and handed to the underlying processor.
//! Every caller but the last gets back a batched sentinel so the Bus
//! Adapter can suppress duplicate outbound events.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::debug;

use oxibot_core::bus::types::InboundMessage;
use oxibot_core::types::{AgentResult, FinishReason, UsageInfo};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionQueueError {
    #[error("SessionQueue disposed")]
    Disposed,
    #[error("SessionQueue is disposed")]
    AlreadyDisposed,
    #[error("{0}")]
    ProcessingFailed(String),
}

/// Signature of the underlying agent processor the queue flushes into.
pub type ProcessorFn = Arc<
    dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = anyhow::Result<AgentResult>> + Send>>
        + Send
        + Sync,
>;

struct PendingCall {
    message: InboundMessage,
    reply: oneshot::Sender<Result<AgentResult, SessionQueueError>>,
}

struct SessionState {
    pending: VecDeque<PendingCall>,
    processing: bool,
    debounce_gen: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            processing: false,
            debounce_gen: 0,
        }
    }
}

/// Per-session debounced serializer in front of the Agent Loop.
pub struct SessionQueue {
    processor: ProcessorFn,
    debounce_ms: u64,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
    disposed: AtomicBool,
    shutdown: Arc<Notify>,
}

impl SessionQueue {
    pub fn new(processor: ProcessorFn, debounce_ms: Option<u64>) -> Self {
        Self {
            processor,
            debounce_ms: debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
            sessions: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Enqueue an inbound message for `self`'s session key. Resolves once
    /// the merged turn this message ended up in has completed — either
    /// with the real result (last caller in the merge) or the batched
    /// sentinel (every earlier caller).
    pub async fn process_message(
        self: &Arc<Self>,
        message: InboundMessage,
    ) -> Result<AgentResult, SessionQueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SessionQueueError::AlreadyDisposed);
        }

        let key = message.session_key();
        let state = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::new())))
                .clone()
        };

        let (tx, rx) = oneshot::channel();
        let gen = {
            let mut guard = state.lock().await;
            guard.pending.push_back(PendingCall { message, reply: tx });
            let already_processing = guard.processing;
            guard.debounce_gen += 1;
            let gen = guard.debounce_gen;
            drop(guard);

            if !already_processing {
                self.arm_debounce(key, state.clone(), gen);
            }
            gen
        };
        let _ = gen;

        rx.await.unwrap_or(Err(SessionQueueError::Disposed))
    }

    fn arm_debounce(self: &Arc<Self>, key: String, state: Arc<Mutex<SessionState>>, gen: u64) {
        let this = self.clone();
        let debounce_ms = self.debounce_ms;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(debounce_ms)) => {}
                _ = this.shutdown.notified() => return,
            }

            let still_current = {
                let guard = state.lock().await;
                guard.debounce_gen == gen && !guard.processing
            };
            if still_current {
                this.flush(key, state).await;
            }
        });
    }

    async fn flush(self: &Arc<Self>, key: String, state: Arc<Mutex<SessionState>>) {
        let batch = {
            let mut guard = state.lock().await;
            if guard.pending.is_empty() {
                return;
            }
            guard.processing = true;
            guard.pending.drain(..).collect::<Vec<_>>()
        };

        debug!(session = %key, batch_len = batch.len(), "flushing session queue");

        let merged = merge(&batch);
        let result = (self.processor)(merged).await;

        let n = batch.len();
        match result {
            Ok(real) => {
                for (i, call) in batch.into_iter().enumerate() {
                    let out = if i + 1 == n {
                        real.clone()
                    } else {
                        AgentResult::batched()
                    };
                    let _ = call.reply.send(Ok(out));
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for call in batch {
                    let _ = call
                        .reply
                        .send(Err(SessionQueueError::ProcessingFailed(msg.clone())));
                }
            }
        }

        let has_more = {
            let mut guard = state.lock().await;
            guard.processing = false;
            !guard.pending.is_empty()
        };

        if has_more {
            let gen = {
                let mut guard = state.lock().await;
                guard.debounce_gen += 1;
                guard.debounce_gen
            };
            self.arm_debounce(key.clone(), state.clone(), gen);
        } else {
            self.sessions.lock().await.remove(&key);
        }
    }

    /// Reject all pending callers and mark the queue unusable.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();

        let sessions = {
            let mut guard = self.sessions.lock().await;
            std::mem::take(&mut *guard)
        };
        for (_, state) in sessions {
            let mut guard = state.lock().await;
            for call in guard.pending.drain(..) {
                let _ = call.reply.send(Err(SessionQueueError::Disposed));
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Merge a burst of messages for one session into a single `InboundMessage`
/// per spec.md §4.6: contents newline-joined in arrival order, media
/// deduplicated preserving first-seen order, metadata left-to-right merged
/// (later wins), and routing fields copied from the last message.
fn merge(batch: &[PendingCall]) -> InboundMessage {
    if batch.len() == 1 {
        return batch[0].message.clone();
    }

    let last = &batch.last().unwrap().message;
    let content = batch
        .iter()
        .map(|c| c.message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut media = Vec::new();
    let mut seen_media = std::collections::HashSet::new();
    for call in batch {
        for m in &call.message.media {
            if seen_media.insert(m.path.clone()) {
                media.push(m.clone());
            }
        }
    }

    let mut metadata = std::collections::HashMap::new();
    for call in batch {
        for (k, v) in &call.message.metadata {
            metadata.insert(k.clone(), v.clone());
        }
    }

    InboundMessage {
        message_id: last.message_id.clone(),
        channel: last.channel.clone(),
        sender_id: last.sender_id.clone(),
        chat_id: last.chat_id.clone(),
        content,
        timestamp: last.timestamp,
        media,
        metadata,
    }
}

/// Convenience for tests that need a cheap deep copy.
#[allow(dead_code)]
fn usage_zero() -> UsageInfo {
    UsageInfo {
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
    }
}

#[allow(dead_code)]
fn _assert_finish_reason_batched_is_comparable(r: &AgentResult) -> bool {
    matches!(r.finish_reason, FinishReason::Batched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Duration as TokioDuration;

    fn make_msg(chat_id: &str, content: &str) -> InboundMessage {
        InboundMessage::new("terminal", "user", chat_id, content)
    }

    fn counting_processor(
        calls: Arc<Mutex<Vec<InboundMessage>>>,
    ) -> ProcessorFn {
        Arc::new(move |msg| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.lock().await.push(msg.clone());
                Ok(AgentResult {
                    text: format!("processed: {}", msg.content),
                    usage: usage_zero(),
                    steps: 1,
                    finish_reason: FinishReason::Stop,
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                })
            })
        })
    }

    #[tokio::test]
    async fn test_single_message_processed_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(SessionQueue::new(counting_processor(calls.clone()), Some(20)));

        let result = queue.process_message(make_msg("c", "hi")).await.unwrap();
        assert_eq!(result.text, "processed: hi");
        assert_eq!(calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_burst_merges_into_one_call() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(SessionQueue::new(counting_processor(calls.clone()), Some(200)));

        let q1 = queue.clone();
        let q2 = queue.clone();
        let q3 = queue.clone();

        let h1 = tokio::spawn(async move { q1.process_message(make_msg("c", "a")).await });
        tokio::time::sleep(TokioDuration::from_millis(10)).await;
        let h2 = tokio::spawn(async move { q2.process_message(make_msg("c", "b")).await });
        tokio::time::sleep(TokioDuration::from_millis(10)).await;
        let h3 = tokio::spawn(async move { q3.process_message(make_msg("c", "c")).await });

        let (r1, r2, r3) = tokio::join!(h1, h2, h3);
        let r1 = r1.unwrap().unwrap();
        let r2 = r2.unwrap().unwrap();
        let r3 = r3.unwrap().unwrap();

        assert_eq!(calls.lock().await.len(), 1);
        assert_eq!(calls.lock().await[0].content, "a\nb\nc");

        assert!(r1.is_batched());
        assert!(r2.is_batched());
        assert!(!r3.is_batched());
        assert_eq!(r3.text, "processed: a\nb\nc");
    }

    #[tokio::test]
    async fn test_session_isolation() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(SessionQueue::new(counting_processor(calls.clone()), Some(30)));

        let qa = queue.clone();
        let qb = queue.clone();
        let ha = tokio::spawn(async move { qa.process_message(make_msg("A", "from a")).await });
        let hb = tokio::spawn(async move { qb.process_message(make_msg("B", "from b")).await });

        ha.await.unwrap().unwrap();
        hb.await.unwrap().unwrap();

        assert_eq!(calls.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_and_future_calls() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(SessionQueue::new(counting_processor(calls.clone()), Some(5_000)));

        let q1 = queue.clone();
        let q2 = queue.clone();
        let h1 = tokio::spawn(async move { q1.process_message(make_msg("c", "a")).await });
        let h2 = tokio::spawn(async move { q2.process_message(make_msg("c", "b")).await });

        tokio::time::sleep(TokioDuration::from_millis(20)).await;
        queue.dispose().await;

        let r1 = h1.await.unwrap();
        let r2 = h2.await.unwrap();
        assert_eq!(r1, Err(SessionQueueError::Disposed));
        assert_eq!(r2, Err(SessionQueueError::Disposed));

        let r3 = queue.process_message(make_msg("c", "late")).await;
        assert_eq!(r3, Err(SessionQueueError::AlreadyDisposed));
    }

    #[tokio::test]
    async fn test_processor_error_propagates_to_every_pending_caller() {
        let processor: ProcessorFn = Arc::new(|_msg| {
            Box::pin(async move { Err(anyhow::anyhow!("llm provider unreachable")) })
        });
        let queue = Arc::new(SessionQueue::new(processor, Some(30)));

        let q1 = queue.clone();
        let q2 = queue.clone();
        let h1 = tokio::spawn(async move { q1.process_message(make_msg("c", "a")).await });
        tokio::time::sleep(TokioDuration::from_millis(5)).await;
        let h2 = tokio::spawn(async move { q2.process_message(make_msg("c", "b")).await });

        let r1 = h1.await.unwrap();
        let r2 = h2.await.unwrap();

        let expected = SessionQueueError::ProcessingFailed("llm provider unreachable".to_string());
        assert_eq!(r1, Err(expected.clone()));
        assert_eq!(r2, Err(expected));
    }

    #[tokio::test]
    async fn test_new_messages_during_processing_get_fresh_debounce() {
        let started = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let processor: ProcessorFn = {
            let calls = calls.clone();
            let started = started.clone();
            Arc::new(move |msg| {
                let calls = calls.clone();
                let started = started.clone();
                Box::pin(async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(TokioDuration::from_millis(60)).await;
                    calls.lock().await.push(msg.clone());
                    Ok(AgentResult {
                        text: "ok".into(),
                        usage: usage_zero(),
                        steps: 1,
                        finish_reason: FinishReason::Stop,
                        tool_calls: Vec::new(),
                        tool_results: Vec::new(),
                    })
                })
            })
        };
        let queue = Arc::new(SessionQueue::new(processor, Some(10)));

        let q1 = queue.clone();
        let h1 = tokio::spawn(async move { q1.process_message(make_msg("c", "first")).await });

        // Arrives while the first flush is still running in `processor`.
        tokio::time::sleep(TokioDuration::from_millis(30)).await;
        let q2 = queue.clone();
        let h2 = tokio::spawn(async move { q2.process_message(make_msg("c", "second")).await });

        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();

        assert_eq!(calls.lock().await.len(), 2);
    }
}
