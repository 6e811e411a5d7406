use std::sync::Arc;

use tracing::debug;

use crate::{
    channel::{ChannelService, MemberRole},
    domain::{ChatId, UserId},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    Denied,
}

/// Decides whether a user may bulk-delete messages in a channel.
///
/// Owners are always allowed; administrators only with the delete-messages
/// right. A failing lookup is returned as `Err` and never folded into `Denied`.
#[derive(Clone)]
pub struct AuthorizationGate {
    channels: Arc<dyn ChannelService>,
}

impl AuthorizationGate {
    pub fn new(channels: Arc<dyn ChannelService>) -> Self {
        Self { channels }
    }

    pub async fn authorize(&self, user_id: UserId, channel_id: ChatId) -> Result<AuthDecision> {
        if self.channels.owner(channel_id).await? == Some(user_id) {
            debug!(user_id = user_id.0, channel_id = channel_id.0, "user owns channel");
            return Ok(AuthDecision::Authorized);
        }

        let member = self.channels.membership(channel_id, user_id).await?;
        let allowed = match member.role {
            MemberRole::Owner => true,
            MemberRole::Administrator => member.can_delete_messages,
            _ => false,
        };
        debug!(
            user_id = user_id.0,
            channel_id = channel_id.0,
            role = ?member.role,
            can_delete = member.can_delete_messages,
            allowed,
            "membership checked"
        );

        Ok(if allowed {
            AuthDecision::Authorized
        } else {
            AuthDecision::Denied
        })
    }
}
