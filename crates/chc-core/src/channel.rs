use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, UserId},
    Result,
};

/// Role of a user inside a channel, as reported by the remote service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberRole {
    Owner,
    Administrator,
    Member,
    Restricted,
    Left,
    Banned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Membership {
    pub role: MemberRole,
    pub can_delete_messages: bool,
}

/// Result of a single delete call that reached the service.
///
/// Transport or permission failures are reported as `Err` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The message does not exist (never existed, or already deleted).
    NotFound,
}

/// Port for the remote messaging service that owns the channel.
#[async_trait]
pub trait ChannelService: Send + Sync {
    /// Owner of the channel, if the service exposes one.
    async fn owner(&self, channel_id: ChatId) -> Result<Option<UserId>>;

    async fn membership(&self, channel_id: ChatId, user_id: UserId) -> Result<Membership>;

    async fn delete_message(&self, channel_id: ChatId, message_id: MessageId)
        -> Result<DeleteOutcome>;
}
