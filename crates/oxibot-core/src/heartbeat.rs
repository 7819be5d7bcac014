//! Heartbeat service — periodic agent wake-up to check for tasks.
//!
//! The agent reads `HEARTBEAT.md` from the workspace and executes any
//! tasks listed there. If nothing needs attention, it replies `HEARTBEAT_OK`.
//! If `HEARTBEAT.md` is empty or contains only headers, the tick is skipped.
//!
//! On top of the bare tick loop this also enforces the proactive-delivery
//! policy: a cooldown since the last delivered message, a per-calendar-day
//! send cap (evaluated in the user's timezone when known), and a
//! skip-sentinel check on the model's own response.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::timezone::local_date;
use crate::utils::atomic_write_json;

// ─────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────

/// Default interval: 30 minutes.
pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 30 * 60;

/// Default cooldown between proactive deliveries: 2 hours.
pub const DEFAULT_COOLDOWN_MS: u64 = 2 * 60 * 60 * 1000;

/// Default maximum proactive sends per calendar day.
pub const DEFAULT_DAILY_CAP: u32 = 5;

/// How many recent sends to retain in the persisted state.
const MAX_RECENT_SENDS: usize = 50;

/// The prompt sent to the agent during a heartbeat tick.
pub const HEARTBEAT_PROMPT: &str = r#"Read HEARTBEAT.md in your workspace (if it exists).
Follow any instructions or tasks listed there.
If nothing needs attention, reply with just: HEARTBEAT_OK"#;

/// Token that indicates "nothing to do".
const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

/// Filler phrases that also count as "nothing to do" even without the
/// literal token, so a chatty model can't force a proactive send.
const FILLER_PATTERNS: &[&str] = &[
    "nothing actionable",
    "no updates",
    "nothing to report",
    "all clear",
];

// ─────────────────────────────────────────────
// Callback types
// ─────────────────────────────────────────────

/// Callback invoked on each heartbeat tick to run an agent turn.
///
/// Receives the heartbeat prompt and returns the agent's response.
pub type OnHeartbeatFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>
        + Send
        + Sync,
>;

/// Callback invoked only when a proactive message actually clears the
/// cooldown/cap/skip-sentinel gate and should be delivered to the user.
pub type OnDeliverFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync,
>;

// ─────────────────────────────────────────────
// Persisted state
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecentSend {
    pub summary: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub last_proactive_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_sends: VecDeque<RecentSend>,
}

impl HeartbeatState {
    fn load(path: &PathBuf) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn record_send(&mut self, summary: String, now: DateTime<Utc>) {
        self.last_proactive_sent_at = Some(now);
        self.recent_sends.push_back(RecentSend { summary, sent_at: now });
        while self.recent_sends.len() > MAX_RECENT_SENDS {
            self.recent_sends.pop_front();
        }
    }

    fn sends_today(&self, now: DateTime<Utc>, tz: Option<&str>) -> u32 {
        let today = local_date(now, tz);
        self.recent_sends
            .iter()
            .filter(|s| local_date(s.sent_at, tz) == today)
            .count() as u32
    }
}

// ─────────────────────────────────────────────
// HeartbeatService
// ─────────────────────────────────────────────

/// Periodic heartbeat that wakes the agent to check `HEARTBEAT.md`.
pub struct HeartbeatService {
    /// Workspace root (where `HEARTBEAT.md` lives).
    workspace: PathBuf,
    /// Callback to invoke (typically `agent.process_direct()`).
    on_heartbeat: Option<OnHeartbeatFn>,
    /// Callback invoked only when a response actually gets delivered.
    on_deliver: Option<OnDeliverFn>,
    /// Interval in seconds between heartbeats.
    interval_s: u64,
    /// Whether the service is enabled.
    enabled: bool,
    /// Minimum time between two proactive deliveries.
    cooldown_ms: u64,
    /// Maximum proactive deliveries per calendar day.
    daily_cap: u32,
    /// Cached IANA timezone of the user, used for daily-cap resets.
    user_timezone: Mutex<Option<String>>,
    state: Mutex<HeartbeatState>,
    state_path: PathBuf,
    shutdown: Arc<Notify>,
    /// Reentrancy guard: a tick in flight blocks a new one from starting.
    busy: AtomicBool,
}

impl HeartbeatService {
    /// Create a new heartbeat service.
    pub fn new(
        workspace: PathBuf,
        on_heartbeat: Option<OnHeartbeatFn>,
        interval_s: Option<u64>,
        enabled: bool,
    ) -> Self {
        let state_path = workspace.join("data").join("heartbeat_state.json");
        let state = HeartbeatState::load(&state_path);
        Self {
            workspace,
            on_heartbeat,
            on_deliver: None,
            interval_s: interval_s.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_S),
            enabled,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            daily_cap: DEFAULT_DAILY_CAP,
            user_timezone: Mutex::new(None),
            state: Mutex::new(state),
            state_path,
            shutdown: Arc::new(Notify::new()),
            busy: AtomicBool::new(false),
        }
    }

    /// Set the heartbeat callback.
    pub fn set_on_heartbeat(&mut self, callback: OnHeartbeatFn) {
        self.on_heartbeat = Some(callback);
    }

    /// Set the delivery callback, invoked only after the cooldown/cap gate.
    pub fn set_on_deliver(&mut self, callback: OnDeliverFn) {
        self.on_deliver = Some(callback);
    }

    /// Override the default cooldown/daily-cap policy.
    pub fn with_policy(mut self, cooldown_ms: u64, daily_cap: u32) -> Self {
        self.cooldown_ms = cooldown_ms;
        self.daily_cap = daily_cap;
        self
    }

    /// Refresh the cached user timezone, e.g. after the Gateway re-reads
    /// the user-profile bootstrap file.
    pub fn set_user_timezone(&self, tz: Option<String>) {
        *self.user_timezone.lock().unwrap() = tz;
    }

    /// Path to `HEARTBEAT.md`.
    fn heartbeat_file(&self) -> PathBuf {
        self.workspace.join("HEARTBEAT.md")
    }

    /// Read `HEARTBEAT.md` content, returning `None` if it doesn't exist.
    fn read_heartbeat_file(&self) -> Option<String> {
        let path = self.heartbeat_file();
        if path.exists() {
            std::fs::read_to_string(&path).ok()
        } else {
            None
        }
    }

    /// Check if `HEARTBEAT.md` has no actionable content.
    ///
    /// Lines that are empty, headers (#), HTML comments, or checkboxes
    /// are not considered actionable.
    fn is_heartbeat_empty(content: Option<&str>) -> bool {
        let content = match content {
            Some(c) if !c.is_empty() => c,
            _ => return true,
        };

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with("<!--")
                || trimmed == "- [ ]"
                || trimmed == "* [ ]"
                || trimmed == "- [x]"
                || trimmed == "* [x]"
            {
                continue;
            }
            return false;
        }

        true
    }

    /// Whether a model response means "nothing to do" — either the literal
    /// token or one of the filler phrases.
    fn is_skip_response(response: &str) -> bool {
        let normalized = response.to_uppercase().replace('_', "");
        if normalized.contains(&HEARTBEAT_OK_TOKEN.replace('_', "")) {
            return true;
        }
        let lower = response.to_lowercase();
        FILLER_PATTERNS.iter().any(|p| lower.contains(p))
    }

    /// Start the heartbeat service (blocking async loop).
    ///
    /// Returns when `stop()` is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.enabled {
            info!("heartbeat disabled");
            self.shutdown.notified().await;
            return Ok(());
        }

        info!(interval_s = self.interval_s, "heartbeat service started");

        loop {
            let sleep_duration = std::time::Duration::from_secs(self.interval_s);

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.tick().await;
                }
                _ = self.shutdown.notified() => {
                    info!("heartbeat service shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Stop the heartbeat service.
    pub fn stop(&self) {
        info!("stopping heartbeat service");
        self.shutdown.notify_waiters();
    }

    /// Execute a single heartbeat tick, guarding against re-entry.
    async fn tick(&self) {
        if self.busy.swap(true, Ordering::AcqRel) {
            debug!("heartbeat: previous tick still executing, skipping");
            return;
        }
        self.run_tick().await;
        self.busy.store(false, Ordering::Release);
    }

    async fn run_tick(&self) {
        let content = self.read_heartbeat_file();

        if Self::is_heartbeat_empty(content.as_deref()) {
            debug!("heartbeat: no tasks (HEARTBEAT.md empty)");
            return;
        }

        info!("heartbeat: checking for tasks...");

        let Some(ref callback) = self.on_heartbeat else {
            return;
        };

        let response = match callback(HEARTBEAT_PROMPT.to_string()).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "heartbeat execution failed");
                return;
            }
        };

        if Self::is_skip_response(&response) {
            info!("heartbeat: OK (no action needed)");
            return;
        }

        let now = Utc::now();
        let tz = self.user_timezone.lock().unwrap().clone();

        let (cooldown_ok, cap_ok) = {
            let state = self.state.lock().unwrap();
            let cooldown_ok = state
                .last_proactive_sent_at
                .map(|last| (now - last).num_milliseconds() as u64 >= self.cooldown_ms)
                .unwrap_or(true);
            let cap_ok = state.sends_today(now, tz.as_deref()) < self.daily_cap;
            (cooldown_ok, cap_ok)
        };

        if !cooldown_ok {
            info!("heartbeat: completed task, suppressed by cooldown");
            return;
        }
        if !cap_ok {
            info!("heartbeat: completed task, suppressed by daily cap");
            return;
        }

        info!("heartbeat: completed task, delivering");
        if let Some(ref deliver) = self.on_deliver {
            if let Err(e) = deliver(response.clone()).await {
                warn!(error = %e, "heartbeat: delivery failed");
                return;
            }
        }

        let mut state = self.state.lock().unwrap();
        state.record_send(response, now);
        if let Err(e) = atomic_write_json(&self.state_path, &*state) {
            warn!(error = %e, "heartbeat: failed to persist state");
        }
    }

    /// Manually trigger a heartbeat (for CLI or testing), bypassing the
    /// `HEARTBEAT.md`-empty check but still honoring the delivery gate.
    pub async fn trigger_now(&self) -> Option<anyhow::Result<String>> {
        let callback = self.on_heartbeat.clone()?;
        Some(callback(HEARTBEAT_PROMPT.to_string()).await)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
