//! Gateway command — orchestrates channels, agent loop, and message routing.
//!
//! Startup sequence:
//! 1. Load config
//! 2. Create message bus
//! 3. Create provider
//! 4. Create session manager + agent loop
//! 5. Create session queue (debounces bursts per chat) and bus adapter
//!    (bridges bus inbound → session queue → bus outbound) — this replaces
//!    the agent loop's own direct bus consumption
//! 6. Create memory extractor, subscribe an inbound handler that schedules
//!    idle- or correction-triggered distillation passes
//! 7. Create cron service, heartbeat service, channel manager
//! 8. Run: `tokio::select!` of bus adapter + channel manager + cron +
//!    heartbeat
//! 9. Handle Ctrl+C for graceful shutdown, reverse construction order

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use oxibot_agent::memory::{contains_correction_signal, MemoryExtractor};
use oxibot_agent::{AgentLoop, ExecToolConfig, ProcessDirectOptions};
use oxibot_channels::{BusAdapter, ChannelManager};
use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::OutboundMessage;
use oxibot_core::config::load_config;
use oxibot_core::heartbeat::HeartbeatService;
use oxibot_core::session::SessionManager;
use oxibot_cron::CronService;
use oxibot_providers::http_provider::create_provider;

use crate::helpers;

/// Prompt handed to the agent loop for a memory-distillation turn. It uses
/// the same file tools as an ordinary turn to update `memory/MEMORY.md`
/// and today's notes.
const MEMORY_EXTRACTION_PROMPT: &str = "Review this conversation so far. If there are durable \
facts, preferences, or decisions worth remembering long-term, use your file tools to update \
memory/MEMORY.md (append, don't duplicate existing entries) and memory/<today>.md for anything \
only relevant short-term. If nothing is worth saving, do nothing and reply with a single word: \
none.";

/// Run the gateway — starts the agent loop + channel manager.
pub async fn run() -> Result<()> {
    println!();
    helpers::print_banner();
    println!("  Mode: Gateway");
    println!();

    // 1. Load config
    let config = load_config(None);
    let defaults = &config.agents.defaults;

    // 2. Resolve workspace
    let workspace = helpers::expand_tilde(&defaults.workspace);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace: {}", workspace.display()))?;

    // 3. Create message bus (shared between agent + channels)
    let bus = Arc::new(MessageBus::new(100));

    // 4. Create provider
    let model = &defaults.model;
    let providers_map = config.providers.to_map();
    let provider = create_provider(model, &providers_map)
        .map_err(|e| anyhow::anyhow!(e))?;

    // 5. Brave API key
    let brave_key = if config.tools.web.search.api_key.is_empty() {
        None
    } else {
        Some(config.tools.web.search.api_key.clone())
    };

    // 6. Create session manager
    let session_manager = SessionManager::new(None)
        .context("failed to create session manager")?;

    // 7. Create agent loop (Arc-wrapped: shared by the bus adapter, cron
    //    callback, heartbeat callback, and memory extractor callback)
    let agent_loop = Arc::new(AgentLoop::new(
        bus.clone(),
        Arc::new(provider),
        workspace.clone(),
        Some(model.to_string()),
        Some(defaults.max_tool_iterations as usize),
        None,
        brave_key,
        Some(ExecToolConfig::default()),
        config.tools.restrict_to_workspace,
        Some(session_manager),
        None,
    ));

    // 8. Session queue in front of the agent loop, bus adapter behind it.
    //    The agent loop no longer consumes the bus directly — its own
    //    `run()` loop is superseded by this pipeline.
    let session_queue = {
        let agent = agent_loop.clone();
        Arc::new(oxibot_agent::SessionQueue::new(
            Arc::new(move |msg| {
                let agent = agent.clone();
                Box::pin(async move { agent.process_message(&msg).await })
            }),
            None,
        ))
    };

    let bus_adapter = {
        let queue = session_queue.clone();
        Arc::new(BusAdapter::new(
            bus.clone(),
            Arc::new(move |msg| {
                let queue = queue.clone();
                Box::pin(async move { Ok(queue.process_message(msg).await?) })
            }),
        ))
    };

    // 8b. Track the most recently active channel/chat, so the heartbeat's
    //     proactive deliveries have somewhere to land.
    let last_active_route: Arc<std::sync::Mutex<Option<(String, String)>>> =
        Arc::new(std::sync::Mutex::new(None));

    // 9. Memory extractor + inbound handler that schedules distillation.
    let memory_extractor = {
        let agent = agent_loop.clone();
        Arc::new(MemoryExtractor::new(
            Arc::new(move |session_key: String| {
                let agent = agent.clone();
                Box::pin(async move {
                    let opts = ProcessDirectOptions {
                        session_key: Some(session_key),
                        system_prompt_override: Some(MEMORY_EXTRACTION_PROMPT.to_string()),
                        ..Default::default()
                    };
                    agent.process_direct("Distill memory now.", opts).await?;
                    Ok(())
                })
            }),
            None,
        ))
    };

    // 10. Create heartbeat service up front so the inbound watcher below
    //     can refresh its cached timezone and delivery route.
    let heartbeat = {
        let agent = agent_loop.clone();
        let callback: oxibot_core::heartbeat::OnHeartbeatFn = Arc::new(move |prompt| {
            let agent = agent.clone();
            Box::pin(async move {
                agent
                    .process_direct(&prompt, ProcessDirectOptions::default())
                    .await
                    .map(|r| r.text)
            })
        });
        let mut heartbeat = HeartbeatService::new(
            workspace.clone(),
            Some(callback),
            None, // default 30 min
            true,
        );

        let bus = bus.clone();
        let route = last_active_route.clone();
        let on_deliver: oxibot_core::heartbeat::OnDeliverFn = Arc::new(move |text| {
            let bus = bus.clone();
            let route = route.clone();
            Box::pin(async move {
                let Some((channel, chat_id)) = route.lock().unwrap().clone() else {
                    debug!("heartbeat: nothing to deliver to, no active route yet");
                    return Ok(());
                };
                let msg = OutboundMessage::new(channel, chat_id, &text);
                bus.publish_outbound(msg)?;
                Ok(())
            })
        });
        heartbeat.set_on_deliver(on_deliver);
        Arc::new(heartbeat)
    };

    // 11. Inbound watcher: tracks the last active route, refreshes the
    //     heartbeat's timezone cache, and schedules memory extraction.
    {
        let extractor = memory_extractor.clone();
        let heartbeat = heartbeat.clone();
        let route = last_active_route.clone();
        let workspace = workspace.clone();
        let mut rx = bus.subscribe_inbound().context("failed to subscribe to inbound bus")?;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        *route.lock().unwrap() = Some((msg.channel.clone(), msg.chat_id.clone()));

                        if let Ok(profile) = std::fs::read_to_string(workspace.join("USER.md")) {
                            let tz = oxibot_core::timezone::extract_user_timezone(&profile);
                            if tz.is_some() {
                                heartbeat.set_user_timezone(tz);
                            }
                        }

                        let session_key = msg.session_key();
                        if contains_correction_signal(&msg.content) {
                            extractor.schedule_urgent_extraction(session_key).await;
                        } else {
                            extractor.schedule_extraction(session_key).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "memory extraction watcher lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // 12. Create cron service
    let cron_service = Arc::new(CronService::new(bus.clone(), None));
    {
        let agent = agent_loop.clone();
        let bus = bus.clone();
        cron_service
            .set_on_job(Arc::new(move |job: oxibot_cron::CronJob| {
                let agent = agent.clone();
                let bus = bus.clone();
                Box::pin(async move {
                    let response = agent
                        .process_direct(&job.payload.message, ProcessDirectOptions::default())
                        .await
                        .map(|r| r.text)
                        .unwrap_or_else(|e| format!("Error: {e}"));

                    // Deliver result to channel if configured
                    if job.payload.deliver {
                        if let Some(ref chat_id) = job.payload.to {
                            let channel = job.payload.channel.as_deref().unwrap_or("cli");
                            let msg = OutboundMessage::new(channel, chat_id.as_str(), &response);
                            if let Err(e) = bus.publish_outbound(msg) {
                                tracing::error!(error = %e, "failed to deliver cron result");
                            }
                        }
                    }

                    Ok(response)
                })
            }))
            .await;
    }

    // Pre-load to show job count in banner
    if let Err(e) = cron_service.load().await {
        tracing::warn!(error = %e, "failed to pre-load cron store");
    }
    let cron_jobs = cron_service.list_jobs().await;

    // 13. Create channel manager. Concrete per-protocol channels are out
    //     of scope here — callers wire their own `Channel` impls in and
    //     register them on this manager before the gateway runs.
    let channel_manager = ChannelManager::new(bus.clone());

    info!(
        model = %model,
        workspace = %workspace.display(),
        channels = ?channel_manager.channel_names(),
        "gateway starting"
    );

    println!(
        "  Model:     {}",
        model
    );
    println!(
        "  Workspace: {}",
        workspace.display()
    );
    println!(
        "  Channels:  {} registered",
        channel_manager.len()
    );
    if !cron_jobs.is_empty() {
        let enabled = cron_jobs.iter().filter(|j| j.enabled).count();
        println!("  Cron:      {} jobs ({} enabled)", cron_jobs.len(), enabled);
    }
    println!("  Heartbeat: every 30m");
    println!();

    if channel_manager.is_empty() {
        println!("  ⚠  No channels registered. The agent loop will run but");
        println!("     only process messages from the internal bus.");
        println!("     Configure channels in ~/.oxibot/config.json");
        println!();
    }

    println!("  Ctrl+C to stop");
    println!();

    // 14. Run: bus adapter + channel manager + cron + heartbeat concurrently
    //     Ctrl+C triggers graceful shutdown, reverse construction order
    tokio::select! {
        _ = bus_adapter.run() => {
            info!("bus adapter exited");
        }
        result = channel_manager.start_all() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "channel manager error");
            }
        }
        result = cron_service.start() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "cron service error");
            }
        }
        result = heartbeat.start() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "heartbeat service error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("  Shutting down...");
            info!("received Ctrl+C, shutting down");
            channel_manager.stop_all().await;
            heartbeat.stop();
            cron_service.stop().await;
            memory_extractor.dispose().await;
            bus_adapter.stop();
            session_queue.dispose().await;
        }
    }

    println!("  Gateway stopped. Goodbye!");
    Ok(())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
