//! Subagent Manager — background task delegation.
//!
//! The main agent can delegate tasks to subagents via the `spawn` tool.
//! Each subagent runs as a `tokio::spawn` task with:
//! - Its own system prompt (task-focused, simpler than the main agent's)
//! - A limited tool registry (filesystem, shell, web — NO message, spawn, edit)
//! - An independent message history (ephemeral, not persisted)
//! - The same LLM provider as the parent
//! - A `CancellationToken` the parent can use to abort the run early
//!
//! On completion, the subagent publishes its result as a `system` inbound
//! message on the bus, targeted at the original channel/chat. The agent
//! loop picks it up and summarizes the result for the user.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::InboundMessage;
use oxibot_core::types::{Message, ToolCall};
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::agent_loop::ExecToolConfig;
use crate::context::ContextBuilder;
use crate::tools::filesystem::{ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::ExecTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Maximum LLM ↔ tool iterations for a subagent task.
const SUBAGENT_MAX_ITERATIONS: usize = 15;

/// Parent conversation turns carried into a subagent's prompt, at most.
const MAX_PARENT_PAIRS: usize = 5;

/// Per-message truncation applied to parent context before it's handed down.
const MAX_PARENT_MESSAGE_CHARS: usize = 2000;

/// Tools a subagent is never allowed to use, regardless of preset —
/// recursion and privilege escalation are blocked at registration time,
/// not by filtering tool calls at runtime.
const ALWAYS_BLOCKED_TOOLS: &[&str] = &["spawn", "message", "cron"];

// ─────────────────────────────────────────────
// SubagentStatus / SubagentState
// ─────────────────────────────────────────────

/// Lifecycle status of a subagent task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The task specification a subagent runs with.
#[derive(Clone, Debug)]
pub struct SubagentSpec {
    pub name: String,
    pub system_prompt: String,
    pub tool_preset: String,
    pub model: String,
    pub max_iterations: usize,
}

/// Full public state of a subagent task, returned by `get_state`/`list_active`.
#[derive(Clone, Debug)]
pub struct SubagentState {
    pub id: String,
    pub spec: SubagentSpec,
    pub status: SubagentStatus,
    pub task: String,
    pub origin_channel: String,
    pub origin_chat_id: String,
    pub result: Option<String>,
}

/// Internal bookkeeping for a running task (adds the cancel token, which
/// is not exposed on the public `SubagentState` snapshot).
struct RunningTask {
    state: SubagentState,
    cancel: CancellationToken,
}

// ─────────────────────────────────────────────
// SubagentManager
// ─────────────────────────────────────────────

/// Manages the lifecycle of background subagent tasks.
///
/// Created once in `AgentLoop::new()` and shared via `Arc`.
/// The `SpawnTool` holds a reference and delegates `spawn()` calls here.
pub struct SubagentManager {
    /// Shared LLM provider (same instance as the parent agent).
    provider: Arc<dyn LlmProvider>,
    /// Workspace root path.
    workspace: PathBuf,
    /// Message bus for announcing results.
    bus: Arc<MessageBus>,
    /// Model name to use for subagent calls.
    model: String,
    /// Brave Search API key (for WebSearchTool).
    brave_api_key: Option<String>,
    /// Exec tool config (timeout, etc.).
    exec_config: ExecToolConfig,
    /// Whether to restrict filesystem tools to workspace.
    restrict_to_workspace: bool,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Currently running and recently finished tasks, keyed by task ID.
    tasks: RwLock<HashMap<String, RunningTask>>,
}

impl SubagentManager {
    /// Create a new subagent manager.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        bus: Arc<MessageBus>,
        model: String,
        brave_api_key: Option<String>,
        exec_config: ExecToolConfig,
        restrict_to_workspace: bool,
        request_config: LlmRequestConfig,
    ) -> Self {
        Self {
            provider,
            workspace,
            bus,
            model,
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a subagent task in the background.
    ///
    /// `parent_context` carries the last few conversational pairs from
    /// the calling agent's history, already truncated, so the subagent
    /// has enough context without re-fetching the parent's full session.
    ///
    /// Returns an immediate confirmation string; the actual work runs as
    /// a `tokio::spawn` task.
    pub async fn spawn(
        self: &Arc<Self>,
        task: String,
        label: Option<String>,
        origin_channel: String,
        origin_chat_id: String,
    ) -> String {
        self.spawn_with_context(task, label, origin_channel, origin_chat_id, &[])
            .await
    }

    /// Same as `spawn`, but accepts parent conversation pairs
    /// (`(role, content)`) to fold into the subagent's prompt.
    pub async fn spawn_with_context(
        self: &Arc<Self>,
        task: String,
        label: Option<String>,
        origin_channel: String,
        origin_chat_id: String,
        parent_context: &[(String, String)],
    ) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        let display_label = label.unwrap_or_else(|| truncate_label(&task));

        let spec = SubagentSpec {
            name: display_label.clone(),
            system_prompt: String::new(),
            tool_preset: "default".into(),
            model: self.model.clone(),
            max_iterations: SUBAGENT_MAX_ITERATIONS,
        };

        let state = SubagentState {
            id: task_id.clone(),
            spec,
            status: SubagentStatus::Running,
            task: task.clone(),
            origin_channel: origin_channel.clone(),
            origin_chat_id: origin_chat_id.clone(),
            result: None,
        };
        let cancel = CancellationToken::new();

        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(
                task_id.clone(),
                RunningTask {
                    state,
                    cancel: cancel.clone(),
                },
            );
        }

        let mgr = Arc::clone(self);
        let tid = task_id.clone();
        let lbl = display_label.clone();
        let t = task.clone();
        let ctx = truncate_parent_context(parent_context);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let result = mgr.run_subagent(&tid, &t, &ctx, &task_cancel).await;

            let (status, text) = if task_cancel.is_cancelled() {
                (SubagentStatus::Cancelled, "Task was cancelled.".to_string())
            } else {
                match result {
                    Ok(response) => (SubagentStatus::Completed, response),
                    Err(e) => {
                        error!(task_id = %tid, error = %e, "subagent task failed");
                        (SubagentStatus::Failed, format!("Task failed: {e}"))
                    }
                }
            };

            mgr.announce_result(&tid, &lbl, &text, &origin_channel, &origin_chat_id)
                .await;

            let mut tasks = mgr.tasks.write().await;
            if let Some(running) = tasks.get_mut(&tid) {
                running.state.status = status;
                running.state.result = Some(text);
            }
            info!(task_id = %tid, "subagent task finished");
        });

        format!("Subagent [{display_label}] started (id: {task_id}). I'll notify you when it completes.")
    }

    /// Run the subagent's LLM ↔ tool loop.
    ///
    /// Builds an isolated context, registers a limited tool set, and loops
    /// LLM ↔ tools until a final answer, max iterations, or cancellation.
    async fn run_subagent(
        &self,
        task_id: &str,
        task: &str,
        parent_context: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!(task_id = %task_id, "subagent starting");

        let mut tools = ToolRegistry::new();
        let allowed_dir = if self.restrict_to_workspace {
            Some(self.workspace.clone())
        } else {
            None
        };

        // Never register spawn/message/cron — recursion and escalation are
        // blocked by omission, not by a runtime name check.
        tools
            .register(Arc::new(ReadFileTool::new(allowed_dir.clone())))
            .expect("tool names are compile-time distinct");
        tools
            .register(Arc::new(WriteFileTool::new(allowed_dir.clone())))
            .expect("tool names are compile-time distinct");
        tools
            .register(Arc::new(ListDirTool::new(allowed_dir)))
            .expect("tool names are compile-time distinct");
        tools
            .register(Arc::new(ExecTool::new(
                self.workspace.clone(),
                Some(self.exec_config.timeout),
                self.restrict_to_workspace,
            )))
            .expect("tool names are compile-time distinct");
        tools
            .register(Arc::new(WebSearchTool::new(self.brave_api_key.clone())))
            .expect("tool names are compile-time distinct");
        tools
            .register(Arc::new(WebFetchTool::new()))
            .expect("tool names are compile-time distinct");
        debug_assert!(tools.tool_names().iter().all(|n| !ALWAYS_BLOCKED_TOOLS.contains(&n.as_str())));

        let system_prompt = self.build_subagent_prompt(task, parent_context);
        let mut messages = vec![Message::system(&system_prompt), Message::user(task)];

        let tool_defs = tools.get_definitions();
        let mut final_content: Option<String> = None;

        for iteration in 0..SUBAGENT_MAX_ITERATIONS {
            if cancel.is_cancelled() {
                info!(task_id = %task_id, "subagent cancelled");
                break;
            }
            debug!(task_id = %task_id, iteration = iteration, "subagent LLM call");

            let response = self
                .provider
                .chat(&messages, Some(&tool_defs), &self.model, &self.request_config)
                .await;

            if response.has_tool_calls() {
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(&mut messages, response.content.clone(), tool_calls.clone());

                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();

                    info!(task_id = %task_id, tool = %tc.function.name, iteration = iteration, "subagent executing tool");

                    let result = tools.execute(&tc.function.name, params).await;
                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }
            } else {
                final_content = response.content;
                break;
            }
        }

        let result = final_content.unwrap_or_else(|| "Subagent completed processing but produced no output.".into());

        info!(task_id = %task_id, result_len = result.len(), "subagent finished");
        Ok(result)
    }

    /// Announce the subagent result back to the bus.
    ///
    /// Publishes an `InboundMessage` with `channel="system"` and
    /// `chat_id="<origin_channel>:<origin_chat_id>"` so the agent loop
    /// can route the response back to the correct conversation.
    async fn announce_result(&self, task_id: &str, label: &str, result: &str, origin_channel: &str, origin_chat_id: &str) {
        let content = format!(
            "## Subagent Result\n\
             **Task**: {label}\n\n\
             {result}\n\n\
             ---\n\
             *Summarize this naturally for the user. Keep it brief. \
             Do not mention 'subagent' or task IDs.*"
        );

        let msg = InboundMessage::new("system", "subagent", format!("{origin_channel}:{origin_chat_id}"), content);

        info!(task_id = %task_id, "announcing subagent result");
        if let Err(e) = self.bus.publish_inbound(msg) {
            error!(task_id = %task_id, error = %e, "failed to announce subagent result");
        }
    }

    /// Build the subagent's system prompt, folding in any parent context.
    fn build_subagent_prompt(&self, task: &str, parent_context: &[(String, String)]) -> String {
        let context_block = if parent_context.is_empty() {
            String::new()
        } else {
            let pairs: Vec<String> = parent_context
                .iter()
                .map(|(role, content)| format!("**{role}**: {content}"))
                .collect();
            format!("\n\n## Recent Conversation (for context only)\n\n{}", pairs.join("\n\n"))
        };

        format!(
            "# Subagent\n\
             You are a subagent spawned by the main agent to complete a specific task.\n\n\
             ## Your Task\n\
             {task}\n\n\
             ## Rules\n\
             1. Stay focused — complete only the assigned task\n\
             2. Your final response will be reported back to the main agent\n\
             3. Do not initiate conversations or take on side tasks\n\
             4. Be concise but informative\n\n\
             ## What You Can Do\n\
             - Read and write files in the workspace\n\
             - List directory contents\n\
             - Execute shell commands\n\
             - Search the web and fetch web pages\n\n\
             ## What You Cannot Do\n\
             - Send messages directly to users (no message tool)\n\
             - Spawn other subagents\n\
             - Edit files in-place (use write_file to overwrite)\n\
             - Schedule cron jobs\n\n\
             ## Workspace\n\
             Your workspace is at: {workspace}\
             {context_block}",
            workspace = self.workspace.display()
        )
    }

    /// Get the full state of a task (running or finished, until it is GC'd
    /// by a future caller; there is currently no explicit eviction).
    pub async fn get_state(&self, id: &str) -> Option<SubagentState> {
        let tasks = self.tasks.read().await;
        tasks.get(id).map(|t| t.state.clone())
    }

    /// List all tasks still in the `Running` status.
    pub async fn list_active(&self) -> Vec<SubagentState> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| t.state.status == SubagentStatus::Running)
            .map(|t| t.state.clone())
            .collect()
    }

    /// Request cancellation of a running task. Returns `false` if the task
    /// is unknown or already finished.
    pub async fn cancel(&self, id: &str) -> bool {
        let tasks = self.tasks.read().await;
        match tasks.get(id) {
            Some(t) if t.state.status == SubagentStatus::Running => {
                t.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Number of tasks still running.
    pub async fn task_count(&self) -> usize {
        self.list_active().await.len()
    }
}

/// Build a short display label by truncating the task description.
fn truncate_label(task: &str) -> String {
    if task.chars().count() > 30 {
        let truncated: String = task.chars().take(30).collect();
        format!("{truncated}…")
    } else {
        task.to_string()
    }
}

/// Keep the last `MAX_PARENT_PAIRS` conversational pairs, each capped at
/// `MAX_PARENT_MESSAGE_CHARS`, so a subagent's prompt stays bounded
/// regardless of how long the parent conversation has grown.
fn truncate_parent_context(pairs: &[(String, String)]) -> Vec<(String, String)> {
    let start = pairs.len().saturating_sub(MAX_PARENT_PAIRS);
    pairs[start..]
        .iter()
        .map(|(role, content)| {
            let truncated: String = content.chars().take(MAX_PARENT_MESSAGE_CHARS).collect();
            (role.clone(), truncated)
        })
        .collect()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
