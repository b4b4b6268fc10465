use crate::protocol::UserId;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the request/response API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid username or password")]
    Auth,

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: &'static str, status: u16 },

    #[error("{endpoint} request failed: {message}")]
    Request {
        endpoint: &'static str,
        message: String,
    },

    #[error("{endpoint} response could not be decoded: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },
}

/// Failures of the push-channel socket itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("socket closed")]
    Closed,
}

/// Why an outbound frame was not handed to the socket.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransmitError {
    #[error("push channel is not connected")]
    NotConnected,

    #[error("push channel task has exited")]
    Closed,

    #[error("outbound frame could not be encoded: {0}")]
    Encode(String),
}

/// A push frame that is not one of the known event kinds.
#[derive(Debug, Error)]
#[error("malformed push event: {0}")]
pub struct ParseError(#[from] pub serde_json::Error);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("user {0} is not in the current user list")]
    NotFound(UserId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Errors surfaced to the embedding UI shell.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no active session")]
    NoSession,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("client runtime has stopped")]
    Stopped,
}

impl ClientError {
    /// True when the relay rejected the credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, ClientError::Api(ApiError::Auth))
    }
}
