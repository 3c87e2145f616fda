//! Browser automation for joining and monitoring meetings.
//!
//! Each platform drives the same conceptual lifecycle: navigate to the join
//! URL, clear password/CAPTCHA challenges, enter a display name, mute, request
//! to join, wait for admission, then monitor the active meeting until it ends.
//! DOM watchers only emit [`AutomationEvent`]s; all reaction logic lives in
//! the shared active-phase loop.

pub mod chime;
pub mod teams;
pub mod webex;
pub mod zoom;

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::prelude::*;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ChatCommands;
use crate::invite::{MeetingInvite, MeetingPlatform};
use crate::status::{ManualActionKind, StatusManager};
use crate::transcription::TranscriptionService;

/// DOM polling cadence during both join and active phases.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Bound on waiting for any single expected element.
pub const SELECTOR_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on waiting in a lobby for a host to admit us.
pub const ADMISSION_TIMEOUT: Duration = Duration::from_secs(600);
/// Bound on waiting for a human to resolve a CAPTCHA or login.
pub const MANUAL_ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Page-text fragments that indicate the meeting is over, shared across
/// platforms as a last-resort end signal.
const ENDED_TEXT_PATTERNS: &[&str] = &[
    "meeting has ended",
    "you have left the meeting",
    "this meeting has been ended",
    "the host has ended the meeting",
];

/// Join-time failures, each mapping to a categorized status reason.
#[derive(Debug, Error)]
pub enum JoinFailure {
    #[error("meeting password was rejected")]
    WrongPassword,
    #[error("meeting id is invalid or unknown")]
    InvalidMeetingId,
    #[error("meeting has already ended")]
    MeetingEnded,
    #[error("not admitted to the meeting")]
    NotAdmitted,
    #[error("manual action was not completed in time")]
    ManualActionExpired,
    #[error("browser automation error: {0}")]
    Automation(#[from] WebDriverError),
}

impl JoinFailure {
    /// Human-readable category surfaced through the status record.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::WrongPassword => "Incorrect meeting password",
            Self::InvalidMeetingId => "Invalid meeting ID",
            Self::MeetingEnded => "Meeting already ended",
            Self::NotAdmitted => "Not admitted by the host",
            Self::ManualActionExpired => "Required manual action timed out",
            Self::Automation(_) => "Browser automation failure",
        }
    }
}

/// How an established meeting came to a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingOutcome {
    Ended,
    TimedOut,
}

/// Control phrase recognized in the platform chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatControl {
    End,
    Pause,
    Resume,
}

/// Observations emitted by DOM watchers; reactions happen elsewhere.
#[derive(Debug)]
pub enum AutomationEvent {
    SpeakerChanged(String),
    ChatCommand(ChatControl),
    MeetingEnded,
}

/// Everything a platform needs to drive one meeting.
pub struct AutomationContext {
    pub invite: MeetingInvite,
    pub status: Arc<StatusManager>,
    pub transcription: Arc<TranscriptionService>,
    pub recording_enabled: Arc<std::sync::atomic::AtomicBool>,
    pub chat_commands: ChatCommands,
    pub max_meeting_duration: Duration,
}

/// Platform-specific selectors consumed by the shared active-phase loop.
pub struct PlatformUi {
    pub speaker_indicator: &'static str,
    /// Control that opens the chat pane; the pane is not in the DOM until
    /// opened on most platforms.
    pub chat_open: Option<&'static str>,
    pub chat_messages: &'static str,
    pub chat_input: Option<&'static str>,
    pub leave_button: &'static str,
    pub ended_markers: &'static [&'static str],
}

/// Dispatch to the invite's platform and run one complete meeting. Join-time
/// failures surface as [`JoinFailure`] inside the error chain so the caller
/// can categorize the terminal status.
pub async fn run(driver: &WebDriver, ctx: &AutomationContext) -> Result<MeetingOutcome> {
    match ctx.invite.platform {
        MeetingPlatform::Zoom => zoom::run(driver, ctx).await,
        MeetingPlatform::Teams => teams::run(driver, ctx).await,
        MeetingPlatform::Webex => webex::run(driver, ctx).await,
        MeetingPlatform::Chime => chime::run(driver, ctx).await,
    }
}

/// Wait for an element to appear, polling up to `timeout`.
pub async fn wait_for(
    driver: &WebDriver,
    selector: &str,
    timeout: Duration,
) -> Result<WebElement, WebDriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        match driver.find(By::Css(selector)).await {
            Ok(element) => return Ok(element),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}

pub async fn element_exists(driver: &WebDriver, selector: &str) -> bool {
    driver.find(By::Css(selector)).await.is_ok()
}

/// Click the element if present; absence is not an error.
pub async fn click_if_present(driver: &WebDriver, selector: &str) -> Result<bool, WebDriverError> {
    match driver.find(By::Css(selector)).await {
        Ok(element) => {
            element.click().await?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

pub async fn type_into(
    driver: &WebDriver,
    selector: &str,
    text: &str,
) -> Result<(), WebDriverError> {
    let field = wait_for(driver, selector, SELECTOR_TIMEOUT).await?;
    field.clear().await?;
    field.send_keys(text).await?;
    Ok(())
}

/// Lowercased page source, for text-pattern checks.
pub async fn page_text(driver: &WebDriver) -> String {
    driver
        .source()
        .await
        .map(|s| s.to_lowercase())
        .unwrap_or_default()
}

pub fn page_indicates_end(text: &str) -> bool {
    ENDED_TEXT_PATTERNS.iter().any(|p| text.contains(p))
}

/// Match a chat message against the configured control phrases.
pub fn parse_chat_command(message: &str, commands: &ChatCommands) -> Option<ChatControl> {
    let message = message.to_lowercase();
    if message.contains(&commands.end) {
        Some(ChatControl::End)
    } else if message.contains(&commands.pause) {
        Some(ChatControl::Pause)
    } else if message.contains(&commands.resume) {
        Some(ChatControl::Resume)
    } else {
        None
    }
}

/// Signal a manual-action requirement and poll until `resolved_selector`
/// appears or the bound expires.
pub async fn await_manual_resolution(
    driver: &WebDriver,
    status: &StatusManager,
    kind: ManualActionKind,
    instruction: &str,
    resolved_selector: &str,
) -> Result<(), JoinFailure> {
    status
        .manual_action_required(kind, instruction, MANUAL_ACTION_TIMEOUT.as_secs())
        .await;

    let deadline = Instant::now() + MANUAL_ACTION_TIMEOUT;
    while Instant::now() < deadline {
        if element_exists(driver, resolved_selector).await {
            status.clear_manual_action().await;
            info!("Manual action resolved");
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL * 2).await;
    }
    status.clear_manual_action().await;
    Err(JoinFailure::ManualActionExpired)
}

/// Open the chat pane so its input and message list enter the DOM. Absence
/// of the control is tolerated; the pane may already be open.
pub async fn open_chat_panel(driver: &WebDriver, ui: &PlatformUi) {
    let Some(toggle) = ui.chat_open else {
        return;
    };
    if let Some(input) = ui.chat_input {
        if element_exists(driver, input).await {
            debug!("Chat pane already open");
            return;
        }
    }
    match click_if_present(driver, toggle).await {
        Ok(true) => {
            if let Some(input) = ui.chat_input {
                if wait_for(driver, input, Duration::from_secs(5)).await.is_err() {
                    warn!("Chat pane did not open after clicking its control");
                }
            }
        }
        Ok(false) => debug!("Chat control not found, continuing without chat"),
        Err(e) => debug!("Chat control click failed: {}", e),
    }
}

/// Post the introductory chat messages. Chat absence is tolerated.
pub async fn send_intro_messages(driver: &WebDriver, ui: &PlatformUi, ctx: &AutomationContext) {
    let Some(input) = ui.chat_input else {
        debug!("No chat surface on this platform, skipping intro");
        return;
    };
    let messages = [
        format!(
            "Hi, I'm {}. I'm here to take notes for this meeting.",
            ctx.invite.caller_name
        ),
        "Say \"hey alex\" followed by a question if you'd like me to help.".to_string(),
    ];
    for message in messages {
        let sent = async {
            let field = wait_for(driver, input, Duration::from_secs(5)).await?;
            field.send_keys(message.as_str()).await?;
            field.send_keys(Key::Enter).await?;
            Ok::<(), WebDriverError>(())
        }
        .await;
        if let Err(e) = sent {
            debug!("Intro chat message not sent: {}", e);
            return;
        }
    }
    info!("Intro chat messages sent");
}

/// Poll the DOM and emit observations. Ends when the channel closes or a
/// meeting-end condition is observed.
async fn watch_loop(
    driver: WebDriver,
    ui: &PlatformUi,
    commands: ChatCommands,
    events: mpsc::Sender<AutomationEvent>,
) {
    let mut last_speaker = String::new();
    let mut seen_messages = usize::MAX;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        // Active speaker indicator.
        if let Ok(element) = driver.find(By::Css(ui.speaker_indicator)).await {
            if let Ok(name) = element.text().await {
                let name = name.trim().to_string();
                if !name.is_empty() && name != last_speaker {
                    last_speaker = name.clone();
                    if events.send(AutomationEvent::SpeakerChanged(name)).await.is_err() {
                        return;
                    }
                }
            }
        }

        // Chat messages: only messages arriving after the first scan count.
        if let Ok(messages) = driver.find_all(By::Css(ui.chat_messages)).await {
            if seen_messages == usize::MAX {
                seen_messages = messages.len();
            } else if messages.len() > seen_messages {
                for message in &messages[seen_messages..] {
                    if let Ok(text) = message.text().await {
                        if let Some(control) = parse_chat_command(&text, &commands) {
                            if events.send(AutomationEvent::ChatCommand(control)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                seen_messages = messages.len();
            }
        }

        // End conditions: hang-up control gone, an ended marker, or page text.
        let mut ended = !element_exists(&driver, ui.leave_button).await;
        if !ended {
            for marker in ui.ended_markers {
                if element_exists(&driver, marker).await {
                    ended = true;
                    break;
                }
            }
        }
        if !ended && page_indicates_end(&page_text(&driver).await) {
            ended = true;
        }
        if ended {
            let _ = events.send(AutomationEvent::MeetingEnded).await;
            return;
        }
    }
}

/// Run the post-admission phase: intro messages, watchers, and the reaction
/// loop, until the meeting ends or the overall duration bound expires.
pub async fn run_active_phase(
    driver: &WebDriver,
    ui: &'static PlatformUi,
    ctx: &AutomationContext,
) -> Result<MeetingOutcome> {
    ctx.transcription.start_transcription().await?;
    open_chat_panel(driver, ui).await;
    send_intro_messages(driver, ui, ctx).await;

    let (events_tx, mut events_rx) = mpsc::channel::<AutomationEvent>(32);
    let watcher = tokio::spawn(watch_loop(
        driver.clone(),
        ui,
        ctx.chat_commands.clone(),
        events_tx,
    ));

    let deadline = Instant::now() + ctx.max_meeting_duration;
    let outcome = loop {
        let event = tokio::select! {
            event = events_rx.recv() => event,
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Meeting duration bound reached");
                break MeetingOutcome::TimedOut;
            }
        };
        let Some(event) = event else {
            break MeetingOutcome::Ended;
        };

        match event {
            AutomationEvent::SpeakerChanged(name) => {
                ctx.transcription.speaker_change(name).await;
            }
            AutomationEvent::ChatCommand(ChatControl::End) => {
                info!("End command received over chat");
                break MeetingOutcome::Ended;
            }
            AutomationEvent::ChatCommand(ChatControl::Pause) => {
                info!("Recording paused by chat command");
                ctx.recording_enabled.store(false, Ordering::SeqCst);
            }
            AutomationEvent::ChatCommand(ChatControl::Resume) => {
                info!("Recording resumed by chat command");
                ctx.recording_enabled.store(true, Ordering::SeqCst);
                if let Err(e) = ctx.transcription.start_transcription().await {
                    warn!("Failed to restart transcription: {:#}", e);
                }
            }
            AutomationEvent::MeetingEnded => {
                info!("Meeting end detected");
                break MeetingOutcome::Ended;
            }
        }
    };

    watcher.abort();
    ctx.recording_enabled.store(false, Ordering::SeqCst);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> ChatCommands {
        ChatCommands::default()
    }

    #[test]
    fn test_chat_command_matching() {
        let c = commands();
        assert_eq!(parse_chat_command("please leave meeting now", &c), Some(ChatControl::End));
        assert_eq!(parse_chat_command("Pause recording please", &c), Some(ChatControl::Pause));
        assert_eq!(parse_chat_command("RESUME RECORDING", &c), Some(ChatControl::Resume));
        assert_eq!(parse_chat_command("hello everyone", &c), None);
    }

    #[test]
    fn test_ended_page_text_patterns() {
        assert!(page_indicates_end("the meeting has ended. thanks!"));
        assert!(page_indicates_end("you have left the meeting"));
        assert!(!page_indicates_end("waiting for the host to start this meeting"));
    }

    #[test]
    fn test_chat_platforms_declare_an_open_control() {
        // A chat input that is never reachable because the pane stays closed
        // would silently drop intro messages and chat commands.
        for ui in [&zoom::UI, &teams::UI, &webex::UI, &chime::UI] {
            if ui.chat_input.is_some() {
                assert!(ui.chat_open.is_some());
            }
        }
    }

    #[test]
    fn test_join_failure_reasons_are_categorized() {
        assert_eq!(JoinFailure::WrongPassword.reason(), "Incorrect meeting password");
        assert_eq!(JoinFailure::InvalidMeetingId.reason(), "Invalid meeting ID");
        assert_eq!(JoinFailure::MeetingEnded.reason(), "Meeting already ended");
        assert_eq!(JoinFailure::NotAdmitted.reason(), "Not admitted by the host");
    }
}
