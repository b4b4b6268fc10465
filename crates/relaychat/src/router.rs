use crate::error::ParseError;
use crate::protocol::{Direction, Message, PushEvent};
use crate::store::ConversationStore;

/// Side effects the runtime carries out after a push frame was applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Routed {
    /// Message appended to the open conversation, with the relay's direction tag.
    pub appended: Option<(Message, Direction)>,
    /// Whether a full refresh of the user list is due.
    pub refresh_users: bool,
}

impl Routed {
    fn discarded() -> Self {
        Self::default()
    }
}

pub fn classify(raw: &str) -> Result<PushEvent, ParseError> {
    Ok(serde_json::from_str(raw)?)
}

/// Parse one inbound frame and apply it to `store`.
///
/// Malformed frames are logged and dropped without touching state.
pub fn route(store: &mut ConversationStore, raw: &str) -> Routed {
    match classify(raw) {
        Ok(event) => apply(store, event),
        Err(e) => {
            tracing::warn!(err = %e, len = raw.len(), "discarding push frame");
            Routed::discarded()
        }
    }
}

pub fn apply(store: &mut ConversationStore, event: PushEvent) -> Routed {
    match event {
        PushEvent::Message { message, direction } => {
            let appended = if store.append_incoming_message(message.clone()) {
                Some((message, direction))
            } else {
                tracing::trace!(
                    sender = message.sender_id,
                    receiver = message.receiver_id,
                    "message outside open conversation"
                );
                None
            };
            Routed {
                appended,
                refresh_users: true,
            }
        }
        PushEvent::UserStatus {
            user_id, online, ..
        } => {
            tracing::debug!(user_id, online, "presence changed");
            Routed {
                appended: None,
                refresh_users: true,
            }
        }
    }
}
