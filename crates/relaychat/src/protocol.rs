use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay-assigned user identifier.
pub type UserId = i64;

// ---------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------

/// The logged-in identity. One per client runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "id")]
    pub user_id: UserId,
    pub username: String,
}

/// A counterpart user as reported by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub online: bool,
}

/// A delivered chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Storage id assigned by the relay. Not a dedup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// True if this message belongs to the unordered pair `{a, b}`.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// Direction of this message as seen by `local`.
    pub fn direction_for(&self, local: UserId) -> Direction {
        if self.sender_id == local {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }
}

/// Delivery direction tag attached by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response API bodies
// ---------------------------------------------------------------------------

/// Body of `POST /api/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

// ---------------------------------------------------------------------------
// Push channel frames
// ---------------------------------------------------------------------------

/// A server-initiated frame on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A message was stored by the relay and fanned out to sender and receiver.
    Message {
        message: Message,
        direction: Direction,
    },
    /// A user connected or disconnected.
    UserStatus {
        user_id: UserId,
        #[serde(default)]
        username: String,
        online: bool,
    },
}

/// Outbound send command. Deliberately untagged: the relay reads it as a bare
/// message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCommand {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}
