//! The client's single dispatch loop.
//!
//! [`ClientRuntime`] owns all client state. API calls, socket I/O and timers
//! run as spawned tasks that post their completions back into the runtime,
//! which applies them one at a time in [`ClientRuntime::step`]. Every
//! completion carries enough context (session epoch, refresh sequence,
//! selection generation, connection id) to be discarded when it is stale.

use crate::api::{HttpRelayApi, RelayApi};
use crate::config::ClientConfig;
use crate::error::{ApiError, ClientError};
use crate::outbound::{self, ComposeBuffer, SendOutcome};
use crate::protocol::{Direction, Message, Session, User, UserId};
use crate::reconnect::{ReconnectPolicy, ReconnectState, Reconnector, RetryDecision};
use crate::router;
use crate::store::{ConversationStore, Selection};
use crate::transport::{
    self, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionState, Dialer, TransportEvent, WsDialer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// State changes reported to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SessionStarted(Session),
    SessionEnded,
    Connection(ConnectionState),
    /// The user list was replaced by a refresh.
    UsersUpdated(Vec<User>),
    UsersUnavailable { error: String, retry_in: Duration },
    SelectionChanged { peer: UserId },
    /// History for the open conversation replaced the view.
    ConversationLoaded { peer: UserId, messages: Vec<Message> },
    HistoryUnavailable {
        peer: UserId,
        error: String,
        retry_in: Duration,
    },
    MessageAppended { message: Message, direction: Direction },
    DraftCleared,
    ReconnectGaveUp { attempts: u32 },
}

/// Completions posted back to the runtime by its spawned tasks.
#[derive(Debug)]
pub enum RuntimeEvent {
    Connection(ConnectionEvent),
    UsersFetched {
        epoch: u64,
        seq: u64,
        result: Result<Vec<User>, ApiError>,
    },
    HistoryFetched {
        epoch: u64,
        selection: Selection,
        result: Result<Vec<Message>, ApiError>,
    },
    ReconnectDue { epoch: u64, attempt: u32 },
    UsersRetryDue { epoch: u64 },
    HistoryRetryDue { epoch: u64, selection: Selection },
    LoginCompleted {
        result: Result<Session, ApiError>,
        reply: oneshot::Sender<Result<Session, ClientError>>,
    },
}

/// Everything that exists only while a session is active.
struct ActiveSession {
    session: Session,
    store: ConversationStore,
    connection: Option<ConnectionHandle>,
    connection_state: ConnectionState,
    users_issued: u64,
    users_applied: u64,
    users_retry: Option<JoinHandle<()>>,
    history_retry: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn new(session: Session) -> Self {
        Self {
            store: ConversationStore::new(session.user_id),
            session,
            connection: None,
            connection_state: ConnectionState::Disconnected,
            users_issued: 0,
            users_applied: 0,
            users_retry: None,
            history_retry: None,
        }
    }

    fn cancel_history_retry(&mut self) {
        if let Some(timer) = self.history_retry.take() {
            timer.abort();
        }
    }

    fn cancel_users_retry(&mut self) {
        if let Some(timer) = self.users_retry.take() {
            timer.abort();
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.cancel_users_retry();
        self.cancel_history_retry();
        if let Some(conn) = &self.connection {
            conn.close();
        }
    }
}

pub struct ClientRuntime<A: RelayApi, D: Dialer> {
    api: Arc<A>,
    dialer: Arc<D>,
    reconnector: Reconnector,
    refresh_retry_delay: Duration,
    active: Option<ActiveSession>,
    epoch: u64,
    next_connection_id: u64,
    draft: ComposeBuffer,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    events_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    notifications: mpsc::UnboundedSender<Notification>,
}

/// Runtime wired to the HTTP API and the WebSocket push channel.
pub type HttpClientRuntime = ClientRuntime<HttpRelayApi, WsDialer>;

impl HttpClientRuntime {
    pub fn from_config(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>), ClientError> {
        let api = HttpRelayApi::from_config(config)?;
        let dialer = WsDialer::from_config(config);
        Ok(Self::new(config, Arc::new(api), Arc::new(dialer)))
    }
}

impl<A: RelayApi, D: Dialer> ClientRuntime<A, D> {
    pub fn new(
        config: &ClientConfig,
        api: Arc<A>,
        dialer: Arc<D>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (notifications, notifications_rx) = mpsc::unbounded_channel();
        let runtime = Self {
            api,
            dialer,
            reconnector: Reconnector::new(config.reconnect_policy()),
            refresh_retry_delay: config.refresh_retry_delay(),
            active: None,
            epoch: 0,
            next_connection_id: 0,
            draft: ComposeBuffer::default(),
            events_tx,
            events_rx,
            connection_tx,
            connection_rx,
            notifications,
        };
        (runtime, notifications_rx)
    }

    /// Replace the reconnect policy taken from the config.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnector = Reconnector::new(policy);
        self
    }

    pub fn with_refresh_retry_delay(mut self, delay: Duration) -> Self {
        self.refresh_retry_delay = delay;
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn store(&self) -> Option<&ConversationStore> {
        self.active.as_ref().map(|a| &a.store)
    }

    pub fn users(&self) -> &[User] {
        self.store().map(|s| s.users()).unwrap_or_default()
    }

    pub fn selected(&self) -> Option<UserId> {
        self.store().and_then(|s| s.selected())
    }

    pub fn conversation(&self) -> &[Message] {
        self.store().map(|s| s.conversation()).unwrap_or_default()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.active
            .as_ref()
            .map(|a| a.connection_state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.active
            .as_ref()
            .and_then(|a| a.connection.as_ref())
            .map(|c| c.id())
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.reconnector.state()
    }

    pub fn draft(&self) -> &str {
        self.draft.text()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Authenticate and start a session. On failure no session is created and
    /// any existing session is left alone.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<Session, ClientError> {
        let session = self.api.login(username, password).await?;
        self.start(session.clone());
        Ok(session)
    }

    /// Begin `session`, replacing any active one: dial the push channel and
    /// load the user list.
    pub fn start(&mut self, session: Session) {
        self.stop();
        self.epoch += 1;
        tracing::info!(
            user_id = session.user_id,
            username = %session.username,
            epoch = self.epoch,
            "session started"
        );
        self.active = Some(ActiveSession::new(session.clone()));
        self.notify(Notification::SessionStarted(session));
        self.connect();
        self.refresh_users();
    }

    /// End the session. Cancels any pending reconnect and retry, closes the
    /// push channel and discards the conversation.
    pub fn stop(&mut self) {
        self.reconnector.cancel();
        if !self.draft.is_empty() {
            self.draft.clear();
            self.notify(Notification::DraftCleared);
        }
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.epoch += 1;
        active.store.clear();
        let was_disconnected = active.connection_state == ConnectionState::Disconnected;
        tracing::info!(user_id = active.session.user_id, epoch = self.epoch, "session ended");
        drop(active);

        if !was_disconnected {
            self.notify(Notification::Connection(ConnectionState::Disconnected));
        }
        self.notify(Notification::SessionEnded);
    }

    /// Open the conversation with `peer` and fetch its history.
    pub fn select_user(&mut self, peer: UserId) -> Result<(), ClientError> {
        let active = self.active.as_mut().ok_or(ClientError::NoSession)?;
        let selection = active.store.select_user(peer)?;
        active.cancel_history_retry();
        tracing::debug!(peer, generation = selection.generation, "conversation selected");
        self.notify(Notification::SelectionChanged { peer });
        self.fetch_history(selection);
        Ok(())
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft.set(text);
    }

    /// Send the draft to the selected user on the current connection.
    pub fn compose_and_send(&mut self) -> SendOutcome {
        let (session, selected, connection) = match &self.active {
            Some(a) => (Some(&a.session), a.store.selected(), a.connection.as_ref()),
            None => (None, None, None),
        };
        let outcome = outbound::compose_and_send(session, selected, &mut self.draft, connection);
        if outcome.cleared_draft() {
            self.notify(Notification::DraftCleared);
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Wait for the next completion from any spawned task.
    pub async fn next_event(&mut self) -> RuntimeEvent {
        // Both senders live in `self`, so neither channel can close.
        tokio::select! {
            Some(event) = self.connection_rx.recv() => RuntimeEvent::Connection(event),
            Some(event) = self.events_rx.recv() => event,
        }
    }

    /// Wait for and apply one event.
    pub async fn step(&mut self) {
        let event = self.next_event().await;
        self.handle(event);
    }

    pub fn handle(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Connection(event) => self.on_connection_event(event),
            RuntimeEvent::UsersFetched { epoch, seq, result } => {
                if self.is_current_epoch(epoch) {
                    self.on_users_fetched(seq, result);
                } else {
                    tracing::debug!(epoch, seq, "discarding user list from ended session");
                }
            }
            RuntimeEvent::HistoryFetched {
                epoch,
                selection,
                result,
            } => {
                if self.is_current_epoch(epoch) {
                    self.on_history_fetched(selection, result);
                } else {
                    tracing::debug!(epoch, peer = selection.peer, "discarding history from ended session");
                }
            }
            RuntimeEvent::ReconnectDue { epoch, attempt } => {
                if !self.is_current_epoch(epoch) || !self.reconnector.take_due(attempt) {
                    tracing::debug!(epoch, attempt, "ignoring stale reconnect timer");
                    return;
                }
                tracing::info!(attempt, "reconnecting push channel");
                self.connect();
            }
            RuntimeEvent::UsersRetryDue { epoch } => {
                if self.is_current_epoch(epoch) {
                    if let Some(active) = self.active.as_mut() {
                        active.users_retry = None;
                    }
                    self.refresh_users();
                }
            }
            RuntimeEvent::HistoryRetryDue { epoch, selection } => {
                if !self.is_current_epoch(epoch) {
                    return;
                }
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if active.store.is_current(selection) {
                    active.history_retry = None;
                    self.fetch_history(selection);
                }
            }
            RuntimeEvent::LoginCompleted { result, reply } => {
                let outcome = match result {
                    Ok(session) => {
                        self.start(session.clone());
                        Ok(session)
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "login failed");
                        Err(ClientError::Api(e))
                    }
                };
                let _ = reply.send(outcome);
            }
        }
    }

    /// Log in without blocking the loop; the result arrives as
    /// [`RuntimeEvent::LoginCompleted`].
    pub(crate) fn spawn_login(
        &self,
        username: String,
        password: String,
        reply: oneshot::Sender<Result<Session, ClientError>>,
    ) {
        let api = Arc::clone(&self.api);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = api.login(&username, &password).await;
            let _ = tx.send(RuntimeEvent::LoginCompleted { result, reply });
        });
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn notify(&self, notification: Notification) {
        // The presentation layer may have gone away; state keeps evolving regardless.
        let _ = self.notifications.send(notification);
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        self.active.is_some() && epoch == self.epoch
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.connection_state != state {
            active.connection_state = state;
            self.notify(Notification::Connection(state));
        }
    }

    /// Dial a fresh push channel, replacing (and closing) the current one.
    fn connect(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        self.next_connection_id += 1;
        let id = ConnectionId(self.next_connection_id);
        let handle = transport::connect(
            Arc::clone(&self.dialer),
            active.session.user_id,
            id,
            self.connection_tx.clone(),
        );
        tracing::debug!(connection = %id, user_id = active.session.user_id, "dialing push channel");
        if let Some(old) = active.connection.replace(handle) {
            old.close();
        }
        self.set_connection_state(ConnectionState::Connecting);
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!(connection = %event.connection, "connection event without a session");
            return;
        };
        if active.connection.as_ref().map(|c| c.id()) != Some(event.connection) {
            tracing::debug!(connection = %event.connection, "ignoring event from replaced connection");
            return;
        }

        match event.event {
            TransportEvent::Opened => {
                self.reconnector.on_open();
                self.set_connection_state(ConnectionState::Connected);
                self.refresh_users();
            }
            TransportEvent::Message(raw) => {
                let routed = router::route(&mut active.store, &raw);
                if let Some((message, direction)) = routed.appended {
                    self.notify(Notification::MessageAppended { message, direction });
                }
                if routed.refresh_users {
                    self.refresh_users();
                }
            }
            TransportEvent::Error(e) => {
                tracing::warn!(connection = %event.connection, err = %e, "push channel error");
            }
            TransportEvent::Closed(reason) => {
                active.connection = None;
                tracing::debug!(connection = %event.connection, ?reason, "push channel down");
                self.set_connection_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnector.on_disconnect() {
            RetryDecision::Schedule { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                let tx = self.events_tx.clone();
                let epoch = self.epoch;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(RuntimeEvent::ReconnectDue { epoch, attempt });
                });
                self.reconnector.arm(attempt, timer);
            }
            RetryDecision::AlreadyPending => {
                tracing::debug!("reconnect already pending");
            }
            RetryDecision::GiveUp { attempts } => {
                tracing::warn!(attempts, "giving up on push channel");
                self.notify(Notification::ReconnectGaveUp { attempts });
            }
        }
    }

    /// Issue a full refresh of the user list.
    fn refresh_users(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.cancel_users_retry();
        active.users_issued += 1;
        let seq = active.users_issued;
        let user_id = active.session.user_id;
        let epoch = self.epoch;
        let api = Arc::clone(&self.api);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_users(user_id).await;
            let _ = tx.send(RuntimeEvent::UsersFetched { epoch, seq, result });
        });
    }

    fn on_users_fetched(&mut self, seq: u64, result: Result<Vec<User>, ApiError>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if seq <= active.users_applied {
            tracing::debug!(seq, applied = active.users_applied, "discarding out-of-date user list");
            return;
        }
        match result {
            Ok(users) => {
                active.users_applied = seq;
                active.store.replace_users(users.clone());
                self.notify(Notification::UsersUpdated(users));
            }
            Err(e) if seq < active.users_issued => {
                tracing::debug!(seq, err = %e, "user refresh failed, newer request in flight");
            }
            Err(e) => {
                let delay = self.refresh_retry_delay;
                tracing::warn!(err = %e, retry_in_ms = delay.as_millis() as u64, "user list unavailable");
                let tx = self.events_tx.clone();
                let epoch = self.epoch;
                active.cancel_users_retry();
                active.users_retry = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(RuntimeEvent::UsersRetryDue { epoch });
                }));
                self.notify(Notification::UsersUnavailable {
                    error: e.to_string(),
                    retry_in: delay,
                });
            }
        }
    }

    fn fetch_history(&self, selection: Selection) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let user_id = active.session.user_id;
        let epoch = self.epoch;
        let api = Arc::clone(&self.api);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_messages(user_id, selection.peer).await;
            let _ = tx.send(RuntimeEvent::HistoryFetched {
                epoch,
                selection,
                result,
            });
        });
    }

    fn on_history_fetched(&mut self, selection: Selection, result: Result<Vec<Message>, ApiError>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.store.is_current(selection) {
            tracing::debug!(
                peer = selection.peer,
                generation = selection.generation,
                "discarding history for previous selection"
            );
            return;
        }
        match result {
            Ok(history) => {
                active.store.replace_conversation(selection, history);
                let messages = active.store.conversation().to_vec();
                self.notify(Notification::ConversationLoaded {
                    peer: selection.peer,
                    messages,
                });
            }
            Err(e) => {
                let delay = self.refresh_retry_delay;
                tracing::warn!(
                    peer = selection.peer,
                    err = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "message history unavailable"
                );
                let tx = self.events_tx.clone();
                let epoch = self.epoch;
                active.cancel_history_retry();
                active.history_retry = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(RuntimeEvent::HistoryRetryDue { epoch, selection });
                }));
                self.notify(Notification::HistoryUnavailable {
                    peer: selection.peer,
                    error: e.to_string(),
                    retry_in: delay,
                });
            }
        }
    }
}
