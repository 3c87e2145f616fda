//! Webex guest web join flow.

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

const GUEST_NAME_INPUT: &str = "input[data-test='guest-name-input']";
const PASSWORD_INPUT: &str = "input[data-test='meeting-password-input']";
const NEXT_BUTTON: &str = "button[data-test='guest-next-button']";
const MUTE_BUTTON: &str = "button[data-test='mute-audio-button']";
const VIDEO_OFF_BUTTON: &str = "button[data-test='stop-video-button']";
const JOIN_BUTTON: &str = "button[data-test='join-meeting-button']";
const SIGNIN_PROMPT: &str = "div[data-test='sign-in-required']";
const LEAVE_BUTTON: &str = "button[data-test='leave-meeting-button']";

pub(super) static UI: PlatformUi = PlatformUi {
    speaker_indicator: "div[data-test='active-speaker-label']",
    chat_open: Some("button[data-test='chat-button']"),
    chat_messages: "div[data-test='chat-message-body']",
    chat_input: Some("textarea[data-test='chat-input']"),
    leave_button: LEAVE_BUTTON,
    ended_markers: &["div[data-test='meeting-ended-screen']"],
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
    let url = format!("https://web.webex.com/meet/{}", ctx.invite.meeting_id);
    info!("Navigating to Webex meeting {}", ctx.invite.meeting_id);
    driver.goto(&url).await?;

    tokio::time::sleep(POLL_INTERVAL * 2).await;
    let text = page_text(driver).await;
    if text.contains("meeting number is invalid") || text.contains("can't find that meeting") {
        return Err(JoinFailure::InvalidMeetingId);
    }
    if text.contains("meeting has ended") {
        return Err(JoinFailure::MeetingEnded);
    }

    // Some sites require a signed-in host account before guests may enter.
    if element_exists(driver, SIGNIN_PROMPT).await {
        await_manual_resolution(
            driver,
            &ctx.status,
            ManualActionKind::Login,
            "Sign in to Webex in the remote-view session",
            GUEST_NAME_INPUT,
        )
        .await?;
    }

    type_into(driver, GUEST_NAME_INPUT, &ctx.invite.caller_name).await?;
    click_if_present(driver, NEXT_BUTTON).await?;

    if let Some(password) = &ctx.invite.meeting_password {
        if element_exists(driver, PASSWORD_INPUT).await {
            type_into(driver, PASSWORD_INPUT, password).await?;
            click_if_present(driver, NEXT_BUTTON).await?;
        }
    }

    click_if_present(driver, MUTE_BUTTON).await?;
    click_if_present(driver, VIDEO_OFF_BUTTON).await?;

    let join = wait_for(driver, JOIN_BUTTON, SELECTOR_TIMEOUT).await?;
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
        if text.contains("password is incorrect") || text.contains("incorrect meeting password") {
            return Err(JoinFailure::WrongPassword);
        }
        if text.contains("meeting has ended") {
            return Err(JoinFailure::MeetingEnded);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(JoinFailure::NotAdmitted)
}
