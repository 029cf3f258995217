//! External authentication and session lifecycle notifications.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::burrow::tunnel::ClientId;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token rejected (status {0})")]
    Rejected(u16),
    #[error("auth endpoint unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<(), AuthError>;
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    #[serde(rename = "AuthToken")]
    auth_token: &'a str,
}

/// Accepts a token when `POST {url}` with `{"AuthToken": ...}` answers 2xx.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    url: String,
    client: reqwest::Client,
}

impl HttpAuthenticator {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<(), AuthError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&AuthRequest { auth_token: token })
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AuthError::Rejected(status.as_u16()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    SessionOpened,
    SessionClosed,
}

#[derive(Debug, Serialize)]
struct Notification<'a> {
    #[serde(rename = "Event")]
    event: SessionEvent,
    #[serde(rename = "ClientID")]
    client_id: ClientId,
    #[serde(rename = "Tunnels")]
    tunnels: &'a [String],
    #[serde(rename = "Key")]
    key: &'a str,
}

/// Fire-and-forget lifecycle hook; delivery failures are only logged.
#[derive(Debug, Clone)]
pub struct Notifier {
    url: String,
    key: String,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            url: url.into(),
            key: key.into(),
            client,
        })
    }

    pub fn notify(&self, event: SessionEvent, client_id: ClientId, tunnels: Vec<String>) {
        let this = self.clone();
        tokio::spawn(async move {
            let body = Notification {
                event,
                client_id,
                tunnels: &tunnels,
                key: &this.key,
            };
            match this.client.post(&this.url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => tracing::warn!(
                    status = resp.status().as_u16(),
                    event = ?event,
                    "notify: endpoint refused event"
                ),
                Err(err) => tracing::warn!(err = %err, event = ?event, "notify: delivery failed"),
            }
        });
    }
}
