use crate::error::TransmitError;
use crate::protocol::{SendCommand, Session, UserId};
use crate::transport::ConnectionHandle;

/// Text the user is composing for the open conversation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ComposeBuffer {
    text: String,
}

impl ComposeBuffer {
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether a send would pass validation (mirrors the enabled state of a send button).
    pub fn is_sendable(&self) -> bool {
        !self.text.trim().is_empty()
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSession,
    NoSelection,
    EmptyContent,
}

/// What happened to a compose-and-send request. Never an error for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Validation failed; nothing was sent and the buffer is untouched.
    Skipped(SkipReason),
    /// Handed to the socket. No delivery acknowledgment is awaited.
    Sent(SendCommand),
    /// The socket was unavailable; the message is lost, not queued.
    Dropped(TransmitError),
}

impl SendOutcome {
    /// True when the compose buffer was cleared.
    pub fn cleared_draft(&self) -> bool {
        !matches!(self, SendOutcome::Skipped(_))
    }
}

/// Validate and transmit the buffer's content on the current connection,
/// then clear the buffer whatever the transmit result.
pub fn compose_and_send(
    session: Option<&Session>,
    selected: Option<UserId>,
    buffer: &mut ComposeBuffer,
    connection: Option<&ConnectionHandle>,
) -> SendOutcome {
    let Some(session) = session else {
        return SendOutcome::Skipped(SkipReason::NoSession);
    };
    let Some(receiver_id) = selected else {
        return SendOutcome::Skipped(SkipReason::NoSelection);
    };
    let content = buffer.text().trim();
    if content.is_empty() {
        return SendOutcome::Skipped(SkipReason::EmptyContent);
    }

    let command = SendCommand {
        sender_id: session.user_id,
        receiver_id,
        content: content.to_string(),
    };
    buffer.clear();

    let result = match connection {
        Some(conn) if conn.is_connected() => conn.send(&command),
        _ => Err(TransmitError::NotConnected),
    };

    match result {
        Ok(()) => {
            tracing::debug!(receiver_id, "message handed to push channel");
            SendOutcome::Sent(command)
        }
        Err(e) => {
            tracing::warn!(receiver_id, err = %e, "dropping outbound message");
            SendOutcome::Dropped(e)
        }
    }
}
