use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use relaychat::ClientConfig;
use relaychat::protocol::{Direction, LoginRequest, Message, PushEvent, SendCommand, Session, User, UserId};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc, oneshot};

struct Account {
    id: UserId,
    username: String,
    password: String,
}

struct Attached {
    conn: u64,
    tx: mpsc::UnboundedSender<String>,
    kick: Arc<Notify>,
}

#[derive(Default)]
struct RelayState {
    accounts: Vec<Account>,
    messages: Vec<Message>,
    clients: HashMap<UserId, Attached>,
    next_conn: u64,
    fail_user_fetches: u32,
    user_fetches: u64,
    message_fetches: u64,
}

impl RelayState {
    fn username(&self, id: UserId) -> String {
        self.accounts
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.username.clone())
            .unwrap_or_default()
    }

    fn deliver(&self, to: UserId, event: &PushEvent) {
        if let Some(client) = self.clients.get(&to)
            && let Ok(frame) = serde_json::to_string(event)
        {
            let _ = client.tx.send(frame);
        }
    }

    fn broadcast(&self, event: &PushEvent) {
        for id in self.clients.keys() {
            self.deliver(*id, event);
        }
    }
}

type Shared = Arc<Mutex<RelayState>>;

fn lock(state: &Shared) -> MutexGuard<'_, RelayState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An in-process relay on a random port speaking the production wire format.
pub struct TestRelay {
    pub addr: SocketAddr,
    state: Shared,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    pub async fn spawn() -> Result<Self> {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/api/login", post(login))
            .route("/api/users", get(users))
            .route("/api/messages", get(messages))
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::warn!(err = %e, "test relay stopped");
            }
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn api_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    /// Client config for this relay with retry delays short enough for tests.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            reconnect_delay_ms: 200,
            refresh_retry_delay_ms: 200,
            request_timeout_ms: 2_000,
            ..ClientConfig::for_relay(self.api_url())
        }
    }

    pub fn add_user(&self, username: &str, password: &str) -> UserId {
        let mut st = lock(&self.state);
        let id = st.accounts.len() as UserId + 1;
        st.accounts.push(Account {
            id,
            username: username.to_string(),
            password: password.to_string(),
        });
        id
    }

    /// Store a message without pushing it to anyone.
    pub fn seed_message(&self, from: UserId, to: UserId, content: &str) {
        let mut st = lock(&self.state);
        let id = st.messages.len() as i64 + 1;
        st.messages.push(Message {
            id: Some(id),
            sender_id: from,
            receiver_id: to,
            content: content.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn stored_messages(&self) -> Vec<Message> {
        lock(&self.state).messages.clone()
    }

    pub fn is_online(&self, id: UserId) -> bool {
        lock(&self.state).clients.contains_key(&id)
    }

    /// Drop the push channel of `id` from the relay side.
    pub fn kick(&self, id: UserId) -> bool {
        match lock(&self.state).clients.get(&id) {
            Some(client) => {
                client.kick.notify_one();
                true
            }
            None => false,
        }
    }

    /// Send an arbitrary text frame to `id`.
    pub fn push_raw(&self, id: UserId, frame: &str) -> bool {
        match lock(&self.state).clients.get(&id) {
            Some(client) => client.tx.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    /// Answer the next `n` user list requests with HTTP 500.
    pub fn fail_user_fetches(&self, n: u32) {
        lock(&self.state).fail_user_fetches = n;
    }

    pub fn user_fetches(&self) -> u64 {
        lock(&self.state).user_fetches
    }

    pub fn message_fetches(&self) -> u64 {
        lock(&self.state).message_fetches
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        for client in lock(&self.state).clients.values() {
            client.kick.notify_one();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn login(State(state): State<Shared>, Json(req): Json<LoginRequest>) -> Response {
    let st = lock(&state);
    match st
        .accounts
        .iter()
        .find(|a| a.username == req.username && a.password == req.password)
    {
        Some(account) => Json(Session {
            user_id: account.id,
            username: account.username.clone(),
        })
        .into_response(),
        None => (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response(),
    }
}

#[derive(Deserialize)]
struct UsersQuery {
    current_user_id: UserId,
}

/// Everyone but the caller, most recent conversation first, then by name.
/// An empty list is encoded as `null`.
async fn users(State(state): State<Shared>, Query(q): Query<UsersQuery>) -> Response {
    let mut st = lock(&state);
    st.user_fetches += 1;
    if st.fail_user_fetches > 0 {
        st.fail_user_fetches -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch users").into_response();
    }

    let me = q.current_user_id;
    let mut last: HashMap<UserId, DateTime<Utc>> = HashMap::new();
    for m in st.messages.iter().filter(|m| m.sender_id == me || m.receiver_id == me) {
        let other = if m.sender_id == me { m.receiver_id } else { m.sender_id };
        let entry = last.entry(other).or_insert(m.timestamp);
        *entry = (*entry).max(m.timestamp);
    }

    let mut list: Vec<User> = st
        .accounts
        .iter()
        .filter(|a| a.id != me)
        .map(|a| User {
            id: a.id,
            username: a.username.clone(),
            online: st.clients.contains_key(&a.id),
        })
        .collect();
    list.sort_by(|a, b| {
        last.get(&b.id)
            .cmp(&last.get(&a.id))
            .then_with(|| a.username.to_lowercase().cmp(&b.username.to_lowercase()))
    });

    let body = if list.is_empty() { None } else { Some(list) };
    Json(body).into_response()
}

#[derive(Deserialize)]
struct MessagesQuery {
    current_user_id: UserId,
    other_user_id: UserId,
}

async fn messages(State(state): State<Shared>, Query(q): Query<MessagesQuery>) -> Response {
    let mut st = lock(&state);
    st.message_fetches += 1;
    let history: Vec<Message> = st
        .messages
        .iter()
        .filter(|m| m.is_between(q.current_user_id, q.other_user_id))
        .cloned()
        .collect();
    let body = if history.is_empty() { None } else { Some(history) };
    Json(body).into_response()
}

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsQuery {
    user_id: UserId,
}

async fn ws_handler(ws: WebSocketUpgrade, Query(q): Query<WsQuery>, State(state): State<Shared>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, q.user_id))
}

fn status_event(st: &RelayState, user_id: UserId, online: bool) -> PushEvent {
    PushEvent::UserStatus {
        user_id,
        username: st.username(user_id),
        online,
    }
}

async fn handle_socket(socket: WebSocket, state: Shared, user_id: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let kick = Arc::new(Notify::new());

    let conn = {
        let mut st = lock(&state);
        st.next_conn += 1;
        let conn = st.next_conn;
        st.clients.insert(
            user_id,
            Attached {
                conn,
                tx,
                kick: Arc::clone(&kick),
            },
        );
        let event = status_event(&st, user_id, true);
        st.broadcast(&event);
        conn
    };
    tracing::debug!(user_id, conn, "relay: client attached");

    loop {
        tokio::select! {
            _ = kick.notified() => break,
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if sink.send(WsMessage::text(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => relay_message(&state, user_id, text.as_str()),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
    let mut st = lock(&state);
    if st.clients.get(&user_id).is_some_and(|c| c.conn == conn) {
        st.clients.remove(&user_id);
        let event = status_event(&st, user_id, false);
        st.broadcast(&event);
    }
    tracing::debug!(user_id, conn, "relay: client detached");
}

/// Store a sent message and push it to both ends with their direction.
fn relay_message(state: &Shared, from: UserId, raw: &str) {
    let command: SendCommand = match serde_json::from_str(raw) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(from, err = %e, "relay: bad send command");
            return;
        }
    };
    let mut st = lock(state);
    let message = Message {
        id: Some(st.messages.len() as i64 + 1),
        sender_id: command.sender_id,
        receiver_id: command.receiver_id,
        content: command.content,
        timestamp: Utc::now(),
    };
    st.messages.push(message.clone());

    st.deliver(
        message.receiver_id,
        &PushEvent::Message {
            message: message.clone(),
            direction: Direction::Incoming,
        },
    );
    st.deliver(
        message.sender_id,
        &PushEvent::Message {
            message,
            direction: Direction::Outgoing,
        },
    );
}
