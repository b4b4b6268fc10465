use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::protocol::{LoginRequest, Message, Session, User, UserId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;

/// The relay's request/response API.
pub trait RelayApi: Send + Sync + 'static {
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Session, ApiError>> + Send;

    /// Every user except `current`, ordered by the relay.
    fn fetch_users(
        &self,
        current: UserId,
    ) -> impl Future<Output = Result<Vec<User>, ApiError>> + Send;

    /// Full history between `current` and `other`, oldest first.
    fn fetch_messages(
        &self,
        current: UserId,
        other: UserId,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;
}

/// HTTP client for the relay API.
#[derive(Debug, Clone)]
pub struct HttpRelayApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRelayApi {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiError::Request {
                endpoint: "client",
                message: e.to_string(),
            })?;
        Ok(Self::new(config.api_url.clone(), http))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

async fn decode<T: DeserializeOwned>(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Status {
            endpoint,
            status: status.as_u16(),
        });
    }
    response.json::<T>().await.map_err(|e| ApiError::Decode {
        endpoint,
        message: e.to_string(),
    })
}

fn request_failed(endpoint: &'static str) -> impl FnOnce(reqwest::Error) -> ApiError {
    move |e| ApiError::Request {
        endpoint,
        message: e.to_string(),
    }
}

impl RelayApi for HttpRelayApi {
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Session, ApiError>> + Send {
        let request = self
            .http
            .post(format!("{}/api/login", self.base_url))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            });
        async move {
            let response = request.send().await.map_err(request_failed("login"))?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(ApiError::Auth);
            }
            decode("login", response).await
        }
    }

    fn fetch_users(
        &self,
        current: UserId,
    ) -> impl Future<Output = Result<Vec<User>, ApiError>> + Send {
        let request = self
            .http
            .get(format!("{}/api/users?current_user_id={current}", self.base_url));
        async move {
            let response = request.send().await.map_err(request_failed("users"))?;
            // The relay encodes an empty list as `null`.
            let users: Option<Vec<User>> = decode("users", response).await?;
            Ok(users.unwrap_or_default())
        }
    }

    fn fetch_messages(
        &self,
        current: UserId,
        other: UserId,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send {
        let request = self.http.get(format!(
            "{}/api/messages?current_user_id={current}&other_user_id={other}",
            self.base_url
        ));
        async move {
            let response = request.send().await.map_err(request_failed("messages"))?;
            let messages: Option<Vec<Message>> = decode("messages", response).await?;
            Ok(messages.unwrap_or_default())
        }
    }
}
