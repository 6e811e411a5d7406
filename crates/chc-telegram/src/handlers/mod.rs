//! Telegram update handlers.
//!
//! Each handler translates a Telegram message into a core event and hands it
//! to the session orchestrator; nothing here holds workflow state.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::debug;

use chc_core::{
    domain::{ChatId, UserId},
    messaging::types::{IncomingEvent, MessageEvent},
};

use crate::router::AppState;

mod commands;
mod forward;

pub use commands::parse_command;
pub use forward::forward_origin;

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(&msg, user_id, text, state).await;
        }
    }

    let event = MessageEvent {
        chat_id,
        user_id,
        forward: forward_origin(&msg),
    };
    debug!(user_id = user_id.0, forward = ?event.forward, "message received");
    state.orchestrator.handle(IncomingEvent::Message(event)).await;
    Ok(())
}
