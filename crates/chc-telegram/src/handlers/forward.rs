use teloxide::types::Message;

use chc_core::{
    domain::{ChatId, MessageId},
    messaging::types::ForwardOrigin,
};

/// Classify a message as a channel forward, some other forward, or not a forward.
pub fn forward_origin(msg: &Message) -> Option<ForwardOrigin> {
    msg.forward()?;

    let origin = match (msg.forward_from_chat(), msg.forward_from_message_id()) {
        (Some(chat), Some(message_id)) if chat.is_channel() => ForwardOrigin::Channel {
            channel_id: ChatId(chat.id.0),
            message_id: MessageId(message_id),
        },
        _ => ForwardOrigin::NotChannel,
    };
    Some(origin)
}
