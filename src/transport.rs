use anyhow::Result;
use async_trait::async_trait;

use crate::bridge::{MediaRef, QueueKey, Sender, SourceMessage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub link_preview: bool,
    /// Message to reply to. Equal to the lane's topic id, it only places the
    /// message in the topic.
    pub reply_to: Option<i64>,
}

impl SendOptions {
    pub fn reply(reply_to: Option<i64>) -> Self {
        Self {
            link_preview: false,
            reply_to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub text: String,
}

/// Everything the relay engine needs from the chat network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the id of the posted message.
    async fn send_text(&self, lane: &QueueKey, text: &str, options: SendOptions) -> Result<i64>;

    /// Posts `media` with `caption` and returns the id of the message that
    /// carries the files.
    async fn send_media(
        &self,
        lane: &QueueKey,
        media: &[MediaRef],
        caption: &str,
        options: SendOptions,
    ) -> Result<i64>;

    async fn edit_message(&self, lane: &QueueKey, message_id: i64, text: &str) -> Result<()>;

    /// `Ok(None)` when the message no longer exists.
    async fn fetch_message(&self, lane: &QueueKey, message_id: i64)
    -> Result<Option<FetchedMessage>>;

    async fn fetch_sender(&self, message: &SourceMessage) -> Result<Option<Sender>>;

    /// Longest text a single message may carry. Longer text is cut at the end.
    fn max_text_chars(&self) -> usize;
}
