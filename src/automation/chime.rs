//! Amazon Chime anonymous web join flow.

use anyhow::{Context, Result};
use thirtyfour::prelude::*;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    click_if_present, element_exists, page_text, run_active_phase, type_into, wait_for,
    AutomationContext, JoinFailure, MeetingOutcome, PlatformUi, ADMISSION_TIMEOUT, POLL_INTERVAL,
    SELECTOR_TIMEOUT,
};

const MEETING_ID_INPUT: &str = "input[data-testid='meeting-id-input']";
const NAME_INPUT: &str = "input[data-testid='attendee-name-input']";
const CONTINUE_BUTTON: &str = "button[data-testid='continue-button']";
const JOIN_MUTED_BUTTON: &str = "button[data-testid='join-muted-button']";
const LEAVE_BUTTON: &str = "button[data-testid='end-meeting-button']";

pub(super) static UI: PlatformUi = PlatformUi {
    speaker_indicator: "div[data-testid='active-speaker-name']",
    chat_open: Some("button[data-testid='chat-button']"),
    chat_messages: "div[data-testid='chat-message-content']",
    chat_input: Some("textarea[data-testid='chat-input']"),
    leave_button: LEAVE_BUTTON,
    ended_markers: &["div[data-testid='meeting-ended-card']"],
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
    info!("Navigating to Chime meeting {}", ctx.invite.meeting_id);
    driver.goto("https://app.chime.aws/meetings").await?;

    // Chime takes the meeting id through a form rather than the URL.
    if element_exists(driver, MEETING_ID_INPUT).await {
        type_into(driver, MEETING_ID_INPUT, &ctx.invite.meeting_id).await?;
        click_if_present(driver, CONTINUE_BUTTON).await?;
    } else {
        driver
            .goto(&format!("https://app.chime.aws/meetings/{}", ctx.invite.meeting_id))
            .await?;
    }

    tokio::time::sleep(POLL_INTERVAL * 2).await;
    let text = page_text(driver).await;
    if text.contains("check your meeting id") || text.contains("meeting id is not valid") {
        return Err(JoinFailure::InvalidMeetingId);
    }
    if text.contains("meeting has ended") {
        return Err(JoinFailure::MeetingEnded);
    }

    type_into(driver, NAME_INPUT, &ctx.invite.caller_name).await?;
    click_if_present(driver, CONTINUE_BUTTON).await?;

    let join = wait_for(driver, JOIN_MUTED_BUTTON, SELECTOR_TIMEOUT).await?;
    join.click().await?;
    debug!("Join requested, waiting for admission");

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
        if text.contains("the organizer declined your request") {
            return Err(JoinFailure::NotAdmitted);
        }
        if text.contains("meeting has ended") {
            return Err(JoinFailure::MeetingEnded);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(JoinFailure::NotAdmitted)
}
