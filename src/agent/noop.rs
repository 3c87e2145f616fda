//! Inert assistant for runs without a configured voice agent.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::VoiceAssistant;

pub struct NoOpAssistant;

#[async_trait]
impl VoiceAssistant for NoOpAssistant {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send_audio_chunk(&self, _pcm: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn send_user_message(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn activate(&self, _window: Option<Duration>, _context: Option<String>) -> Result<()> {
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool {
        false
    }

    fn is_activated(&self) -> bool {
        false
    }

    fn is_speaking(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_is_fully_inert() {
        let assistant = NoOpAssistant;
        assert!(!assistant.is_enabled());
        assert!(!assistant.is_active());
        assert!(!assistant.is_activated());
        assert!(!assistant.is_speaking());
        assistant.start().await.unwrap();
        assistant.activate(None, Some("context".to_string())).await.unwrap();
        assert!(!assistant.is_activated());
        assistant.stop().await.unwrap();
    }
}
