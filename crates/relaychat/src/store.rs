use crate::error::StoreError;
use crate::protocol::{Message, User, UserId};

/// Ticket returned by [`ConversationStore::select_user`]. A history fetch
/// carries it back so late completions for an older selection are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub peer: UserId,
    pub generation: u64,
}

/// Local cache of the user list and the single open conversation.
///
/// The conversation only ever holds messages between `local_user_id` and the
/// selected peer.
#[derive(Debug)]
pub struct ConversationStore {
    local_user_id: UserId,
    users: Vec<User>,
    selected: Option<UserId>,
    generation: u64,
    conversation: Vec<Message>,
}

impl ConversationStore {
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            users: Vec::new(),
            selected: None,
            generation: 0,
            conversation: Vec::new(),
        }
    }

    pub fn local_user_id(&self) -> UserId {
        self.local_user_id
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn selected(&self) -> Option<UserId> {
        self.selected
    }

    /// The selected user re-resolved against the current list. `None` when
    /// nothing is selected or the selection went stale after a refresh.
    pub fn selected_user(&self) -> Option<&User> {
        self.selected.and_then(|id| self.user(id))
    }

    pub fn is_selection_stale(&self) -> bool {
        self.selected.is_some() && self.selected_user().is_none()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    /// Full refresh. The selection pointer is kept by id even if the user vanished.
    pub fn replace_users(&mut self, users: Vec<User>) {
        self.users = users;
        if self.is_selection_stale() {
            tracing::debug!(peer = ?self.selected, "selected user missing from refreshed list");
        }
    }

    /// Open the conversation with `id`. The previous view is discarded at once;
    /// the caller fetches history and hands it to [`Self::replace_conversation`].
    pub fn select_user(&mut self, id: UserId) -> Result<Selection, StoreError> {
        if self.user(id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        self.selected = Some(id);
        self.generation += 1;
        self.conversation.clear();
        Ok(Selection {
            peer: id,
            generation: self.generation,
        })
    }

    pub fn is_current(&self, selection: Selection) -> bool {
        self.selected == Some(selection.peer) && self.generation == selection.generation
    }

    /// Wholesale replacement from a history fetch. Returns false (and changes
    /// nothing) when `selection` is no longer current.
    pub fn replace_conversation(&mut self, selection: Selection, history: Vec<Message>) -> bool {
        if !self.is_current(selection) {
            return false;
        }
        let local = self.local_user_id;
        let total = history.len();
        self.conversation = history
            .into_iter()
            .filter(|m| m.is_between(local, selection.peer))
            .collect();
        if self.conversation.len() != total {
            tracing::warn!(
                peer = selection.peer,
                dropped = total - self.conversation.len(),
                "history contained messages outside the conversation"
            );
        }
        true
    }

    /// Append a pushed message if it belongs to the open conversation.
    pub fn append_incoming_message(&mut self, message: Message) -> bool {
        let Some(peer) = self.selected else {
            return false;
        };
        if !message.is_between(self.local_user_id, peer) {
            return false;
        }
        self.conversation.push(message);
        true
    }

    /// Drop the conversation and selection. Used on logout.
    pub fn clear(&mut self) {
        self.selected = None;
        self.generation += 1;
        self.conversation.clear();
    }
}
