use crate::api::RelayApi;
use crate::error::ClientError;
use crate::outbound::SendOutcome;
use crate::protocol::{Session, UserId};
use crate::runtime::ClientRuntime;
use crate::transport::Dialer;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 64;

/// User commands delivered to a spawned runtime.
#[derive(Debug)]
pub enum Command {
    Login {
        username: String,
        password: String,
        reply: oneshot::Sender<Result<Session, ClientError>>,
    },
    SelectUser {
        peer: UserId,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    SetDraft(String),
    Send {
        reply: oneshot::Sender<SendOutcome>,
    },
    Logout {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end for a runtime running on its own task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
}

impl ClientHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, ClientError> {
        let (username, password) = (username.to_string(), password.to_string());
        self.request(|reply| Command::Login {
            username,
            password,
            reply,
        })
        .await?
    }

    pub async fn select_user(&self, peer: UserId) -> Result<(), ClientError> {
        self.request(|reply| Command::SelectUser { peer, reply }).await?
    }

    pub async fn set_draft(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.commands
            .send(Command::SetDraft(text.into()))
            .await
            .map_err(|_| ClientError::Stopped)
    }

    /// Send the current draft.
    pub async fn send(&self) -> Result<SendOutcome, ClientError> {
        self.request(|reply| Command::Send { reply }).await
    }

    /// Replace the draft with `text` and send it.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<SendOutcome, ClientError> {
        self.set_draft(text).await?;
        self.send().await
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Logout { reply }).await
    }
}

impl<A: RelayApi, D: Dialer> ClientRuntime<A, D> {
    /// Move the runtime onto its own task. The loop ends, closing the
    /// session, once every [`ClientHandle`] is dropped.
    pub fn spawn(self) -> (ClientHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(rx));
        (ClientHandle { commands: tx }, task)
    }

    /// Drive the runtime from `commands` until the channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.next_event() => self.handle(event),
            }
        }
        self.stop();
        tracing::debug!("client runtime stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Login {
                username,
                password,
                reply,
            } => self.spawn_login(username, password, reply),
            Command::SelectUser { peer, reply } => {
                let _ = reply.send(self.select_user(peer));
            }
            Command::SetDraft(text) => self.set_draft(text),
            Command::Send { reply } => {
                let _ = reply.send(self.compose_and_send());
            }
            Command::Logout { reply } => {
                self.stop();
                let _ = reply.send(());
            }
        }
    }
}
