use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{debug, warn};

use chc_core::{
    domain::{ChatId, UserId},
    messaging::{
        port::Messenger,
        types::{Command, CommandKind, IncomingEvent},
    },
};

use crate::router::AppState;

const USAGE: &str = "Available commands:\n\
/start - Initialize a session\n\
/clear - Clear all messages before a forwarded channel message\n\
/stop - Cancel the clearing process";

/// Split `/cmd@botname args` into a lowercase command name and the rest.
pub fn parse_command(text: &str) -> (String, String) {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

pub(super) async fn handle_command(
    msg: &Message,
    user_id: UserId,
    text: &str,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let (cmd, _args) = parse_command(text);

    let Some(kind) = CommandKind::parse(&cmd) else {
        debug!(user_id = user_id.0, cmd = %cmd, "unknown command");
        let chat_id = ChatId(msg.chat.id.0);
        if let Err(e) = state.messenger.send_text(chat_id, USAGE).await {
            warn!(chat_id = chat_id.0, error = %e, "failed to send usage");
        }
        return Ok(());
    };

    debug!(user_id = user_id.0, ?kind, "command received");
    state
        .orchestrator
        .handle(IncomingEvent::Command(Command {
            chat_id: ChatId(msg.chat.id.0),
            user_id,
            kind,
        }))
        .await;
    Ok(())
}
