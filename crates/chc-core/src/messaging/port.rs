use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    Result,
};

/// Outbound side of the chat transport.
///
/// Inbound events are pushed into the orchestrator by the adapter's update
/// handlers, so the port only needs to send replies.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;
}
