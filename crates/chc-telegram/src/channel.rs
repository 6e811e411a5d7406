use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{ChatMember, ChatMemberKind},
    ApiError, RequestError,
};

use chc_core::{
    channel::{ChannelService, DeleteOutcome, MemberRole, Membership},
    domain::{ChatId, MessageId, UserId},
    Error, Result,
};

use crate::{map_err, tg_chat, tg_msg_id, tg_user, with_retry};

/// [`ChannelService`] over the Bot API.
///
/// The bot itself must be an administrator of the channel with the
/// delete-messages right, otherwise every delete comes back as an error.
#[derive(Clone)]
pub struct TelegramChannelService {
    bot: Bot,
}

impl TelegramChannelService {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChannelService for TelegramChannelService {
    async fn owner(&self, channel_id: ChatId) -> Result<Option<UserId>> {
        let admins = with_retry(|| self.bot.get_chat_administrators(tg_chat(channel_id)))
            .await
            .map_err(map_err)?;

        Ok(owner_of(&admins))
    }

    async fn membership(&self, channel_id: ChatId, user_id: UserId) -> Result<Membership> {
        let member = with_retry(|| {
            self.bot
                .get_chat_member(tg_chat(channel_id), tg_user(user_id))
        })
        .await
        .map_err(map_err)?;

        Ok(membership_of(&member))
    }

    async fn delete_message(
        &self,
        channel_id: ChatId,
        message_id: MessageId,
    ) -> Result<DeleteOutcome> {
        // No retry here: the deletion loop waits out rate limits itself so a
        // stop request can interrupt the wait.
        let res = self
            .bot
            .delete_message(tg_chat(channel_id), tg_msg_id(message_id))
            .await;
        delete_outcome(res.map(|_| ()))
    }
}

pub(crate) fn owner_of(admins: &[ChatMember]) -> Option<UserId> {
    admins
        .iter()
        .find(|m| matches!(m.kind, ChatMemberKind::Owner(_)))
        .map(|m| UserId(m.user.id.0 as i64))
}

pub(crate) fn membership_of(member: &ChatMember) -> Membership {
    let (role, can_delete_messages) = match &member.kind {
        ChatMemberKind::Owner(_) => (MemberRole::Owner, true),
        ChatMemberKind::Administrator(a) => (MemberRole::Administrator, a.can_delete_messages),
        ChatMemberKind::Member => (MemberRole::Member, false),
        ChatMemberKind::Restricted(_) => (MemberRole::Restricted, false),
        ChatMemberKind::Left => (MemberRole::Left, false),
        ChatMemberKind::Banned(_) => (MemberRole::Banned, false),
    };
    Membership {
        role,
        can_delete_messages,
    }
}

pub(crate) fn delete_outcome(
    res: std::result::Result<(), RequestError>,
) -> Result<DeleteOutcome> {
    match res {
        Ok(()) => Ok(DeleteOutcome::Deleted),
        Err(e) if is_not_found(&e) => Ok(DeleteOutcome::NotFound),
        Err(RequestError::RetryAfter(wait)) => Err(Error::RateLimited(wait)),
        Err(e) => Err(map_err(e)),
    }
}

/// "Message to delete not found" means the id is already gone: a skip, not a failure.
pub(crate) fn is_not_found(e: &RequestError) -> bool {
    match e {
        RequestError::Api(ApiError::MessageToDeleteNotFound) => true,
        RequestError::Api(ApiError::Unknown(desc)) => {
            desc.to_lowercase().contains("message to delete not found")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(id: u64, status: serde_json::Value) -> ChatMember {
        let mut v = json!({
            "user": { "id": id, "is_bot": false, "first_name": "U" }
        });
        if let (Some(obj), Some(more)) = (v.as_object_mut(), status.as_object()) {
            for (k, val) in more {
                obj.insert(k.clone(), val.clone());
            }
        }
        serde_json::from_value(v).unwrap()
    }

    fn owner(id: u64) -> ChatMember {
        member(id, json!({ "status": "creator", "is_anonymous": false }))
    }

    fn admin(id: u64, can_delete_messages: bool) -> ChatMember {
        member(
            id,
            json!({
                "status": "administrator",
                "is_anonymous": false,
                "can_be_edited": false,
                "can_manage_chat": true,
                "can_change_info": false,
                "can_post_messages": true,
                "can_edit_messages": false,
                "can_delete_messages": can_delete_messages,
                "can_manage_video_chats": false,
                "can_invite_users": false,
                "can_restrict_members": false,
                "can_pin_messages": false,
                "can_manage_topics": false,
                "can_promote_members": false
            }),
        )
    }

    #[test]
    fn owner_is_found_among_administrators() {
        let admins = vec![admin(7, true), owner(42), admin(9, false)];
        assert_eq!(owner_of(&admins), Some(UserId(42)));
        assert_eq!(owner_of(&[admin(7, true)]), None);
    }

    #[test]
    fn membership_maps_roles_and_delete_right() {
        let m = membership_of(&owner(1));
        assert_eq!(m.role, MemberRole::Owner);
        assert!(m.can_delete_messages);

        let m = membership_of(&admin(2, true));
        assert_eq!(m.role, MemberRole::Administrator);
        assert!(m.can_delete_messages);

        let m = membership_of(&admin(3, false));
        assert_eq!(m.role, MemberRole::Administrator);
        assert!(!m.can_delete_messages);

        let m = membership_of(&member(4, json!({ "status": "member" })));
        assert_eq!(m.role, MemberRole::Member);
        assert!(!m.can_delete_messages);

        let m = membership_of(&member(5, json!({ "status": "left" })));
        assert_eq!(m.role, MemberRole::Left);
    }

    #[test]
    fn delete_rate_limit_is_handed_to_the_caller() {
        let wait = std::time::Duration::from_secs(7);
        assert!(matches!(
            delete_outcome(Err(RequestError::RetryAfter(wait))),
            Err(Error::RateLimited(w)) if w == wait
        ));
        assert!(matches!(
            delete_outcome(Err(RequestError::Api(ApiError::MessageToDeleteNotFound))),
            Ok(DeleteOutcome::NotFound)
        ));
        assert!(matches!(delete_outcome(Ok(())), Ok(DeleteOutcome::Deleted)));
        assert!(matches!(
            delete_outcome(Err(RequestError::Api(ApiError::MessageCantBeDeleted))),
            Err(Error::External(_))
        ));
    }

    #[test]
    fn not_found_is_recognized() {
        assert!(is_not_found(&RequestError::Api(
            ApiError::MessageToDeleteNotFound
        )));
        assert!(is_not_found(&RequestError::Api(ApiError::Unknown(
            "Bad Request: message to delete not found".to_string()
        ))));
    }

    #[test]
    fn other_errors_are_failures() {
        assert!(!is_not_found(&RequestError::Api(
            ApiError::MessageCantBeDeleted
        )));
        assert!(!is_not_found(&RequestError::Api(ApiError::Unknown(
            "Bad Request: not enough rights".to_string()
        ))));
        assert!(!is_not_found(&RequestError::RetryAfter(
            std::time::Duration::from_secs(3)
        )));
    }
}
