//! Microsoft Teams anonymous web join flow.

use anyhow::{Context, Result};
use thirtyfour::prelude::*;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    click_if_present, element_exists, page_text, run_active_phase, type_into, wait_for,
    AutomationContext, JoinFailure, MeetingOutcome, PlatformUi, ADMISSION_TIMEOUT, POLL_INTERVAL,
    SELECTOR_TIMEOUT,
};

const CONTINUE_ON_WEB: &str = "button[data-tid='joinOnWeb']";
const NAME_INPUT: &str = "input[data-tid='prejoin-display-name-input']";
const MIC_TOGGLE: &str = "div[data-tid='toggle-mute']";
const CAMERA_TOGGLE: &str = "div[data-tid='toggle-video']";
const JOIN_BUTTON: &str = "button[data-tid='prejoin-join-button']";
const LEAVE_BUTTON: &str = "button[data-tid='hangup-main-btn']";

pub(super) static UI: PlatformUi = PlatformUi {
    speaker_indicator: "div[data-tid='active-speaker-name']",
    chat_open: Some("button[data-tid='chat-button']"),
    chat_messages: "div[data-tid='chat-pane-message']",
    chat_input: Some("div[data-tid='ckeditor'] div[contenteditable='true']"),
    leave_button: LEAVE_BUTTON,
    ended_markers: &["div[data-tid='call-ended-screen']", "button[data-tid='call-rejoin-button']"],
};

pub async fn run(driver: &WebDriver, ctx: &AutomationContext) -> Result<MeetingOutcome> {
    join(driver, ctx).await?;
    ctx.status
        .set_joined()
        .await
        .context("Failed to report joined status")?;
    run_active_phase(driver, &UI, ctx).await
}

async fn join(driver: &WebDriver, ctx: &AutomationContext) -> Result<(), JoinFailure> {
    let mut url = format!("https://teams.microsoft.com/v2/meet/{}", ctx.invite.meeting_id);
    if let Some(password) = &ctx.invite.meeting_password {
        url.push_str(&format!("?p={}", password));
    }
    info!("Navigating to Teams meeting {}", ctx.invite.meeting_id);
    driver.goto(&url).await?;

    // The launcher interstitial offers app or browser.
    click_if_present(driver, CONTINUE_ON_WEB).await?;

    tokio::time::sleep(POLL_INTERVAL * 2).await;
    let text = page_text(driver).await;
    if text.contains("meeting link is invalid") || text.contains("we couldn't find the meeting") {
        return Err(JoinFailure::InvalidMeetingId);
    }
    if text.contains("the meeting has ended") {
        return Err(JoinFailure::MeetingEnded);
    }

    type_into(driver, NAME_INPUT, &ctx.invite.caller_name).await?;
    click_if_present(driver, MIC_TOGGLE).await?;
    click_if_present(driver, CAMERA_TOGGLE).await?;

    let join = wait_for(driver, JOIN_BUTTON, SELECTOR_TIMEOUT).await?;
    join.click().await?;
    debug!("Join requested, waiting in lobby");

    wait_for_admission(driver).await
}

async fn wait_for_admission(driver: &WebDriver) -> Result<(), JoinFailure> {
    let deadline = Instant::now() + ADMISSION_TIMEOUT;
    while Instant::now() < deadline {
        if element_exists(driver, LEAVE_BUTTON).await {
            info!("Admitted to the meeting");
            return Ok(());
        }
        let text = page_text(driver).await;
        if text.contains("you were denied entry") || text.contains("removed from the meeting") {
            return Err(JoinFailure::NotAdmitted);
        }
        if text.contains("the meeting has ended") {
            return Err(JoinFailure::MeetingEnded);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(JoinFailure::NotAdmitted)
}
