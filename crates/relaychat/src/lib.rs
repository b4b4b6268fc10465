//! Realtime one-to-one messaging client.
//!
//! Keeps a live push channel to a message relay, a local view of the other
//! users and their presence, and the open conversation consistent with the
//! events the relay pushes. A UI shell either owns a [`ClientRuntime`] and
//! calls [`ClientRuntime::step`], or spawns it and talks to it through a
//! [`ClientHandle`].

pub mod api;
pub mod config;
pub mod error;
pub mod handle;
pub mod outbound;
pub mod protocol;
pub mod reconnect;
pub mod router;
pub mod runtime;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{HttpRelayApi, RelayApi};
pub use config::ClientConfig;
pub use error::ClientError;
pub use handle::ClientHandle;
pub use outbound::SendOutcome;
pub use protocol::{Direction, Message, Session, User, UserId};
pub use reconnect::ReconnectPolicy;
pub use runtime::{ClientRuntime, HttpClientRuntime, Notification};
pub use transport::{ConnectionState, WsDialer};
