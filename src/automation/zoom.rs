//! Zoom web-client join flow.

use anyhow::{Context, Result};
use thirtyfour::prelude::*;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    await_manual_resolution, click_if_present, element_exists, page_text, run_active_phase,
    type_into, wait_for, AutomationContext, JoinFailure, MeetingOutcome, PlatformUi,
    ADMISSION_TIMEOUT, POLL_INTERVAL, SELECTOR_TIMEOUT,
};
use crate::status::ManualActionKind;

const NAME_INPUT: &str = "#input-for-name";
const PASSWORD_INPUT: &str = "#input-for-pwd";
const JOIN_BUTTON: &str = "button.preview-join-button";
const MUTE_BUTTON: &str = "#preview-audio-control-button";
const VIDEO_OFF_BUTTON: &str = "#preview-video-control-button";
const CAPTCHA_FRAME: &str = "iframe[title*='recaptcha']";
const LEAVE_BUTTON: &str = "button[aria-label='Leave']";

pub(super) static UI: PlatformUi = PlatformUi {
    speaker_indicator: ".speaker-active-container__video-frame .video-avatar__avatar-name",
    chat_open: Some("button[aria-label*='chat panel']"),
    chat_messages: ".new-chat-message__text-content",
    chat_input: Some(".chat-rtf-box__editor-outline div[contenteditable='true']"),
    leave_button: LEAVE_BUTTON,
    ended_markers: &[".zm-modal-body-title", ".meeting-info-container--ended"],
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
    let url = format!("https://zoom.us/wc/join/{}", ctx.invite.meeting_id);
    info!("Navigating to Zoom meeting {}", ctx.invite.meeting_id);
    driver.goto(&url).await?;

    check_join_page_errors(driver).await?;

    // Zoom fronts the web client with a CAPTCHA for unauthenticated joins.
    if element_exists(driver, CAPTCHA_FRAME).await {
        await_manual_resolution(
            driver,
            &ctx.status,
            ManualActionKind::Captcha,
            "Complete the CAPTCHA in the remote-view session",
            NAME_INPUT,
        )
        .await?;
    }

    type_into(driver, NAME_INPUT, &ctx.invite.caller_name).await?;
    if let Some(password) = &ctx.invite.meeting_password {
        if element_exists(driver, PASSWORD_INPUT).await {
            type_into(driver, PASSWORD_INPUT, password).await?;
        }
    }

    click_if_present(driver, MUTE_BUTTON).await?;
    click_if_present(driver, VIDEO_OFF_BUTTON).await?;

    let join = wait_for(driver, JOIN_BUTTON, SELECTOR_TIMEOUT).await?;
    join.click().await?;
    debug!("Join requested, waiting for admission");

    wait_for_admission(driver).await
}

/// Zoom reports bad ids and ended meetings as page-level errors before the
/// preview screen appears.
async fn check_join_page_errors(driver: &WebDriver) -> Result<(), JoinFailure> {
    tokio::time::sleep(POLL_INTERVAL * 2).await;
    let text = page_text(driver).await;
    if text.contains("this meeting id is not valid") || text.contains("invalid meeting id") {
        return Err(JoinFailure::InvalidMeetingId);
    }
    if text.contains("meeting has ended") {
        return Err(JoinFailure::MeetingEnded);
    }
    Ok(())
}

async fn wait_for_admission(driver: &WebDriver) -> Result<(), JoinFailure> {
    let deadline = Instant::now() + ADMISSION_TIMEOUT;
    while Instant::now() < deadline {
        if element_exists(driver, LEAVE_BUTTON).await {
            info!("Admitted to the meeting");
            return Ok(());
        }
        let text = page_text(driver).await;
        if text.contains("passcode wrong") || text.contains("incorrect passcode") {
            return Err(JoinFailure::WrongPassword);
        }
        if text.contains("meeting has ended") {
            return Err(JoinFailure::MeetingEnded);
        }
        if text.contains("host has removed you") {
            return Err(JoinFailure::NotAdmitted);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(JoinFailure::NotAdmitted)
}
