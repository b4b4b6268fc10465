//! In-memory stand-ins for the relay API and push socket used by unit tests.

use crate::api::RelayApi;
use crate::error::{ApiError, TransportError};
use crate::protocol::{Direction, Message, PushEvent, Session, User, UserId};
use crate::transport::{Dialer, Socket};
use chrono::Utc;
use futures_util::SinkExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::PollSender;

pub const PASSWORD: &str = "password123";

pub fn user(id: UserId, name: &str) -> User {
    User {
        id,
        username: name.to_string(),
        online: false,
    }
}

pub fn message(from: UserId, to: UserId, content: &str) -> Message {
    Message {
        id: None,
        sender_id: from,
        receiver_id: to,
        content: content.to_string(),
        timestamp: Utc::now(),
    }
}

pub fn message_frame(from: UserId, to: UserId, content: &str, direction: Direction) -> String {
    serde_json::to_string(&PushEvent::Message {
        message: message(from, to, content),
        direction,
    })
    .unwrap()
}

pub fn status_frame(user_id: UserId, online: bool) -> String {
    serde_json::to_string(&PushEvent::UserStatus {
        user_id,
        username: format!("user{user_id}"),
        online,
    })
    .unwrap()
}

// ---------------------------------------------------------------------------
// MockApi
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ApiState {
    accounts: HashMap<String, Session>,
    users: Vec<User>,
    history: HashMap<UserId, Vec<Message>>,
    history_delay: HashMap<UserId, Duration>,
    users_delays: VecDeque<Duration>,
    users_failures: u32,
    history_failures: u32,
    user_fetches: u32,
    history_fetches: Vec<UserId>,
}

#[derive(Default)]
pub struct MockApi {
    state: Mutex<ApiState>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_account(&self, session: Session) {
        let mut st = self.state.lock().unwrap();
        st.accounts.insert(session.username.clone(), session);
    }

    pub fn set_users(&self, users: Vec<User>) {
        self.state.lock().unwrap().users = users;
    }

    pub fn set_history(&self, peer: UserId, history: Vec<Message>) {
        self.state.lock().unwrap().history.insert(peer, history);
    }

    pub fn delay_history(&self, peer: UserId, delay: Duration) {
        self.state.lock().unwrap().history_delay.insert(peer, delay);
    }

    /// Delays applied to the next user fetches, in call order.
    pub fn delay_next_user_fetches(&self, delays: impl IntoIterator<Item = Duration>) {
        self.state.lock().unwrap().users_delays.extend(delays);
    }

    pub fn fail_user_fetches(&self, n: u32) {
        self.state.lock().unwrap().users_failures = n;
    }

    pub fn fail_history_fetches(&self, n: u32) {
        self.state.lock().unwrap().history_failures = n;
    }

    pub fn user_fetches(&self) -> u32 {
        self.state.lock().unwrap().user_fetches
    }

    pub fn history_fetches(&self) -> Vec<UserId> {
        self.state.lock().unwrap().history_fetches.clone()
    }
}

fn unavailable(endpoint: &'static str) -> ApiError {
    ApiError::Status {
        endpoint,
        status: 503,
    }
}

impl RelayApi for MockApi {
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Session, ApiError>> + Send {
        let st = self.state.lock().unwrap();
        let result = match st.accounts.get(username) {
            Some(session) if password == PASSWORD => Ok(session.clone()),
            _ => Err(ApiError::Auth),
        };
        std::future::ready(result)
    }

    fn fetch_users(
        &self,
        _current: UserId,
    ) -> impl Future<Output = Result<Vec<User>, ApiError>> + Send {
        let mut st = self.state.lock().unwrap();
        st.user_fetches += 1;
        let delay = st.users_delays.pop_front();
        let result = if st.users_failures > 0 {
            st.users_failures -= 1;
            Err(unavailable("users"))
        } else {
            Ok(st.users.clone())
        };
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }

    fn fetch_messages(
        &self,
        _current: UserId,
        other: UserId,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send {
        let mut st = self.state.lock().unwrap();
        st.history_fetches.push(other);
        let delay = st.history_delay.get(&other).copied();
        let result = if st.history_failures > 0 {
            st.history_failures -= 1;
            Err(unavailable("messages"))
        } else {
            Ok(st.history.get(&other).cloned().unwrap_or_default())
        };
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }
}

// ---------------------------------------------------------------------------
// MockDialer
// ---------------------------------------------------------------------------

/// Server side of an in-memory push socket. Dropping it disconnects the client.
pub struct MockSocket {
    pub user_id: UserId,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    from_client: mpsc::Receiver<String>,
}

impl MockSocket {
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.to_client.send(Ok(frame.into()));
    }

    pub fn fail(&self, err: TransportError) {
        let _ = self.to_client.send(Err(err));
    }

    pub fn try_sent(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

pub struct MockDialer {
    accepted: mpsc::UnboundedSender<MockSocket>,
    failures: AtomicU32,
    hold: AtomicBool,
    dials: Mutex<Vec<Instant>>,
}

impl MockDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockSocket>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            accepted,
            failures: AtomicU32::new(0),
            hold: AtomicBool::new(false),
            dials: Mutex::new(Vec::new()),
        });
        (dialer, rx)
    }

    /// Refuse the next `n` dials.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Leave subsequent dials pending forever.
    pub fn hold_dials(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }
}

impl Dialer for MockDialer {
    fn dial(&self, user_id: UserId) -> impl Future<Output = Result<Socket, TransportError>> + Send {
        self.dials.lock().unwrap().push(Instant::now());
        let hold = self.hold.load(Ordering::SeqCst);

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if refused {
            Err(TransportError::Dial("connection refused".to_string()))
        } else {
            let (to_client, to_client_rx) = mpsc::unbounded_channel();
            let (from_client_tx, from_client) = mpsc::channel(64);
            let sink = PollSender::new(from_client_tx).sink_map_err(|_| TransportError::Closed);
            let stream = UnboundedReceiverStream::new(to_client_rx);
            let _ = self.accepted.send(MockSocket {
                user_id,
                to_client,
                from_client,
            });
            Ok(Socket {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        };

        async move {
            if hold {
                std::future::pending::<()>().await;
            }
            result
        }
    }
}
