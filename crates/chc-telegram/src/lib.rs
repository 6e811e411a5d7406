//! Telegram adapter (teloxide).
//!
//! Implements the `chc-core` ports over the Telegram Bot API: replies go through
//! [`TelegramMessenger`], channel lookups and deletions through
//! [`channel::TelegramChannelService`].

use async_trait::async_trait;

use teloxide::{prelude::*, RequestError};

use tokio::time::sleep;

pub mod channel;
pub mod handlers;
pub mod router;

use chc_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    messaging::port::Messenger,
    Result,
};

pub(crate) fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

pub(crate) fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(message_id.0)
}

pub(crate) fn tg_user(user_id: UserId) -> teloxide::types::UserId {
    teloxide::types::UserId(user_id.0 as u64)
}

pub(crate) fn map_err(e: RequestError) -> Error {
    Error::External(format!("telegram error: {e}"))
}

/// Run a request, sleeping out a single 429 `RetryAfter` before giving up.
pub(crate) async fn with_retry<T, Fut>(
    mut op: impl FnMut() -> Fut,
) -> std::result::Result<T, RequestError>
where
    Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
    Fut::IntoFuture: Send,
{
    const MAX_RETRIES: usize = 1;
    let mut attempts = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                attempts += 1;
                tracing::debug!(wait = ?d, "telegram asked us to retry later");
                sleep(d).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let msg = with_retry(|| self.bot.send_message(tg_chat(chat_id), text.to_string()))
            .await
            .map_err(map_err)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}
