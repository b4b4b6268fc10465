//! Integration test helpers for relaychat end-to-end scenarios.
//!
//! [`harness::relay::TestRelay`] runs an in-process relay with the same HTTP
//! and WebSocket wire format as the production service, so flows in `tests/`
//! exercise the real `reqwest` and `tokio-tungstenite` client stack.

pub mod harness;
