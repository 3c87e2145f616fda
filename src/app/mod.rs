//! Orchestrator: wires status, events, transcription, agent, and automation
//! together for one meeting, and performs the ordered teardown.

use anyhow::{Context, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::ChromeCapabilities;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::agent::build_assistant;
use crate::automation::{self, AutomationContext, JoinFailure, MeetingOutcome};
use crate::config::Config;
use crate::events::ingest::{IngestPublisher, MeetingEvent};
use crate::events::EventsClient;
use crate::invite::MeetingInvite;
use crate::mcp::McpCommandHandler;
use crate::status::registry::{InstanceRegistry, TaskRegistryEntry};
use crate::status::StatusManager;
use crate::transcription::TranscriptionService;

/// Bound on waiting for the local remote-view server to accept connections.
const VNC_READY_TIMEOUT: Duration = Duration::from_secs(60);
/// How far ahead of the scheduled start the participant enters the meeting.
const JOIN_LEAD: Duration = Duration::from_secs(30);
/// Registry records outlive the longest allowed meeting by a margin.
const REGISTRY_TTL_SECS: i64 = 8 * 3600;

/// Run one complete virtual-participant lifecycle.
pub async fn run_participant() -> Result<()> {
    let config = Config::load()?;
    let invite = MeetingInvite::from_env()?;
    info!(
        "Participant {} joining {} meeting {}",
        invite.participant_id,
        invite.platform.as_str(),
        invite.meeting_id
    );

    let status = Arc::new(StatusManager::new(&config, invite.participant_id.clone()));

    wait_for_vnc(&config).await?;
    status.set_connecting().await;

    // Call id comes from the remote record when the backend has one.
    let call_id = match status.fetch().await {
        Ok(record) => record.call_id.unwrap_or_else(|| invite.meeting_id.clone()),
        Err(e) => {
            warn!("Could not fetch participant record: {:#}", e);
            invite.meeting_id.clone()
        }
    };

    let registry = InstanceRegistry::new(&config);
    let private_ip = register_instance(&config, &registry, &status, &invite).await?;

    wait_for_scheduled_start(&invite).await;

    let ingest = IngestPublisher::new(&config);
    ingest
        .publish(MeetingEvent::MeetingStart {
            call_id: call_id.clone(),
            platform: invite.platform.as_str().to_string(),
            participant_id: invite.participant_id.clone(),
        })
        .await;

    let events = match &config.events_endpoint {
        Some(_) => match EventsClient::connect(&config).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Events connection failed, continuing without pub/sub: {:#}", e);
                None
            }
        },
        None => None,
    };

    let mcp = match (&config.mcp_server_command, &events) {
        (Some(command), Some(events)) => {
            match McpCommandHandler::start(command, events.clone(), &call_id).await {
                Ok(handler) => Some(handler),
                Err(e) => {
                    warn!("Tool command handler failed to start: {:#}", e);
                    None
                }
            }
        }
        _ => None,
    };

    let agent = build_assistant(&config.agent)?;
    agent.start().await.context("Voice assistant failed to start")?;

    let recording_enabled = Arc::new(AtomicBool::new(true));
    let transcription = Arc::new(TranscriptionService::new(
        &config,
        status.clone(),
        ingest.clone(),
        agent.clone(),
        call_id.clone(),
        recording_enabled.clone(),
    ));

    status.set_joining().await;
    let driver = launch_browser(&config).await?;

    let ctx = AutomationContext {
        invite,
        status: status.clone(),
        transcription: transcription.clone(),
        recording_enabled,
        chat_commands: config.chat_commands.clone(),
        max_meeting_duration: config.max_meeting_duration,
    };

    let result = tokio::select! {
        result = automation::run(&driver, &ctx) => result,
        _ = shutdown_signal() => {
            info!("Termination signal received");
            Ok(MeetingOutcome::Ended)
        }
    };

    // Ordered teardown; each step is independent of the previous one failing.
    if let Some(ip) = &private_ip {
        registry.deregister_target(ip, config.vnc_port).await;
    }
    ingest
        .publish(MeetingEvent::MeetingEnd {
            call_id: call_id.clone(),
            transcript: transcription.captions_snapshot().await,
        })
        .await;

    match &result {
        Ok(outcome) => {
            info!("Meeting finished: {:?}", outcome);
            status.set_completed().await;
        }
        Err(e) => {
            let reason = e
                .downcast_ref::<JoinFailure>()
                .map(JoinFailure::reason)
                .unwrap_or("Unexpected automation failure");
            warn!("Meeting failed ({}): {:#}", reason, e);
            status.set_failed(Some(reason)).await;
        }
    }

    transcription.stop_transcription().await;
    if let Err(e) = agent.stop().await {
        warn!("Voice assistant stop failed: {:#}", e);
    }
    if let Some(mcp) = mcp {
        mcp.stop().await;
    }
    if let Some(events) = events {
        events.close().await;
    }
    if let Err(e) = driver.quit().await {
        warn!("Browser session did not close cleanly: {}", e);
    }

    // A recording uploader may run alongside; announce its artifact if known.
    if let Ok(url) = std::env::var("RECORDING_UPLOAD_URL") {
        ingest
            .publish(MeetingEvent::RecordingAvailable { call_id, url })
            .await;
    }

    result.map(|_| ())
}

/// Wait for the local remote-view server to accept TCP connections. Fatal in
/// production; local test runs proceed without it.
async fn wait_for_vnc(config: &Config) -> Result<()> {
    let address = ("127.0.0.1", config.vnc_port);
    let deadline = Instant::now() + VNC_READY_TIMEOUT;
    while Instant::now() < deadline {
        if tokio::net::TcpStream::connect(address).await.is_ok() {
            info!("Remote-view server ready on port {}", config.vnc_port);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    if config.execution_mode.absorbs_transport_errors() {
        warn!("Remote-view server not reachable, continuing without it");
        return Ok(());
    }
    anyhow::bail!("Remote-view server not ready within {:?}", VNC_READY_TIMEOUT)
}

/// Register with the target group (hard precondition when configured),
/// publish the remote-view endpoint and the task registry entry (best
/// effort). Returns the instance IP when known, for later deregistration.
async fn register_instance(
    config: &Config,
    registry: &InstanceRegistry,
    status: &StatusManager,
    invite: &MeetingInvite,
) -> Result<Option<String>> {
    let identity = match registry.task_identity().await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Execution metadata unavailable: {:#}", e);
            if config.target_group_arn.is_some() {
                anyhow::bail!("Target-group registration requires execution metadata");
            }
            return Ok(None);
        }
    };

    let entry = TaskRegistryEntry::new(&invite.participant_id, &identity, REGISTRY_TTL_SECS);
    registry.publish_registry_entry(&entry).await;

    let Some(ip) = identity.private_ip else {
        warn!("Execution metadata carries no private IP");
        if config.target_group_arn.is_some() {
            anyhow::bail!("Target-group registration requires a private IP");
        }
        return Ok(None);
    };

    if config.target_group_arn.is_some() {
        registry
            .register_target(&ip, config.vnc_port)
            .await
            .context("Target-group registration failed")?;
    }
    status.publish_vnc_endpoint(ip.clone(), config.vnc_port).await;

    Ok(Some(ip))
}

/// Sleep until shortly before the scheduled start, if it is in the future.
async fn wait_for_scheduled_start(invite: &MeetingInvite) {
    let Some(scheduled) = invite.scheduled_start else {
        return;
    };
    let until_start = (scheduled - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let delay = until_start.saturating_sub(JOIN_LEAD);
    if delay > Duration::ZERO {
        info!("Waiting {:?} until the scheduled start", delay);
        tokio::time::sleep(delay).await;
    }
}

async fn launch_browser(config: &Config) -> Result<WebDriver> {
    let mut caps = ChromeCapabilities::new();
    caps.add_arg("--no-sandbox")?;
    caps.add_arg("--disable-dev-shm-usage")?;
    caps.add_arg("--use-fake-ui-for-media-stream")?;
    caps.add_arg("--window-size=1280,720")?;
    caps.add_arg("--autoplay-policy=no-user-gesture-required")?;

    let driver = WebDriver::new(&config.webdriver_url, caps)
        .await
        .context("Failed to start the automation browser")?;
    driver
        .set_implicit_wait_timeout(Duration::from_secs(2))
        .await?;
    Ok(driver)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
