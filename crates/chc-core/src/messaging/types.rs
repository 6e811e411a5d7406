use crate::domain::{ChatId, MessageId, UserId};

/// Transport-agnostic incoming update model.
///
/// Telegram-specific fields stay in the Telegram adapter.
#[derive(Clone, Debug)]
pub enum IncomingEvent {
    Command(Command),
    Message(MessageEvent),
}

/// Commands understood by the bot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Clear,
    Stop,
}

impl CommandKind {
    /// Parse a bare command name (no leading `/`, no `@botname`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "clear" => Some(Self::Clear),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Command {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub kind: CommandKind,
}

/// Where a forwarded message came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardOrigin {
    /// Forwarded from a channel post; `message_id` is the id in the source channel.
    Channel {
        channel_id: ChatId,
        message_id: MessageId,
    },
    /// Forwarded from a user, group or hidden sender.
    NotChannel,
}

#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub forward: Option<ForwardOrigin>,
}
