//! Memory Extractor — idle- and correction-triggered background distillation
//! of session history into the workspace memory files.
//!
//! Grounded on the same `tokio::select!{ sleep | shutdown }` per-timer shape
//! as `HeartbeatService::start`, generalized to one timer per session key
//! instead of a single global tick, with a generation counter (as in
//! `SessionQueue`) so a fresh `schedule_extraction` call invalidates a timer
//! that's already in flight.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default idle window before an extraction fires, absent user activity.
pub const DEFAULT_IDLE_MS: u64 = 10 * 60 * 1000;

/// Callback that performs the actual LLM distillation for a session and
/// writes the result to the workspace memory files.
pub type ExtractionFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

struct SessionEntry {
    generation: u64,
    running: bool,
}

/// Schedules and runs memory-distillation passes per session, on an idle
/// timer or an urgent bypass, with at most one extraction in flight per
/// session at a time.
pub struct MemoryExtractor {
    callback: ExtractionFn,
    idle_ms: u64,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    disposed: AtomicBool,
    shutdown: Arc<Notify>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryExtractor {
    /// Create a new extractor. `idle_ms` defaults to `DEFAULT_IDLE_MS`.
    pub fn new(callback: ExtractionFn, idle_ms: Option<u64>) -> Self {
        Self {
            callback,
            idle_ms: idle_ms.unwrap_or(DEFAULT_IDLE_MS),
            sessions: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// (Re)arm the idle timer for `session_key`. A later call before the
    /// timer fires bumps the generation, so the stale timer becomes a no-op.
    pub async fn schedule_extraction(self: &Arc<Self>, session_key: impl Into<String>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let session_key = session_key.into();
        let entry = self.entry_for(&session_key).await;

        let generation = {
            let mut guard = entry.lock().await;
            guard.generation += 1;
            guard.generation
        };

        let this = Arc::clone(self);
        let key = session_key.clone();
        let entry = Arc::clone(&entry);
        let idle_ms = self.idle_ms;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(idle_ms)) => {}
                _ = this.shutdown.notified() => return,
            }

            let should_run = {
                let guard = entry.lock().await;
                guard.generation == generation && !guard.running
            };
            if should_run {
                this.run_extraction(&key, &entry).await;
            } else {
                debug!(session_key = %key, "memory extractor: idle timer superseded, skipping");
            }
        });

        self.track(handle).await;
    }

    /// Bypass the idle debounce and queue an immediate extraction for
    /// `session_key`, used when inbound content trips a correction signal.
    pub async fn schedule_urgent_extraction(self: &Arc<Self>, session_key: impl Into<String>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let session_key = session_key.into();
        let entry = self.entry_for(&session_key).await;

        {
            let mut guard = entry.lock().await;
            guard.generation += 1;
        }

        if entry.lock().await.running {
            debug!(session_key = %session_key, "memory extractor: urgent request ignored, extraction already running");
            return;
        }

        let this = Arc::clone(self);
        let key = session_key.clone();
        let entry = Arc::clone(&entry);
        let handle = tokio::spawn(async move {
            this.run_extraction(&key, &entry).await;
        });
        self.track(handle).await;
    }

    async fn run_extraction(&self, session_key: &str, entry: &Arc<Mutex<SessionEntry>>) {
        {
            let mut guard = entry.lock().await;
            if guard.running {
                return;
            }
            guard.running = true;
        }

        info!(session_key = %session_key, "memory extractor: running distillation");
        if let Err(e) = (self.callback)(session_key.to_string()).await {
            error!(session_key = %session_key, error = %e, "memory extraction failed");
        }

        let mut guard = entry.lock().await;
        guard.running = false;
    }

    async fn entry_for(&self, session_key: &str) -> Arc<Mutex<SessionEntry>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionEntry {
                    generation: 0,
                    running: false,
                }))
            })
            .clone()
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Cancel all pending idle timers and await any extraction already in
    /// flight. Safe to call multiple times.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "memory extractor: task panicked during dispose");
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
