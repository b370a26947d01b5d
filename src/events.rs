//! Server push channel: the `{event, data}` envelope broadcast over the admin
//! websocket, and a reconnecting subscriber for it.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message as WsMessage,
    },
};

use crate::screen_share::ScreenShareSession;
use crate::settings::BackoffSettings;
use crate::types::{ChannelKind, Conversation, Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "conversation:updated")]
    ConversationUpdated(Conversation),
    #[serde(rename = "message:new")]
    MessageCreated(Message),
    #[serde(rename = "screenShare:updated")]
    ScreenShareUpdated(ScreenShareSession),
    #[serde(rename = "config:updated")]
    ConfigUpdated { channel: ChannelKind },
}

impl ServerEvent {
    pub fn to_payload(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    settings: BackoffSettings,
    next: Duration,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            next: settings.initial,
        }
    }

    /// Delay to wait before the next attempt; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.settings.max);
        self.next = delay.saturating_mul(2).min(self.settings.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.settings.initial;
    }
}

/// Receives push-channel lifecycle and events. Called from the subscriber
/// task, so implementations must not block.
pub trait PushHandler: Send + Sync {
    fn on_connected(&self);
    fn on_event(&self, event: ServerEvent);
    fn on_disconnected(&self);
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push url: {0}")]
    Request(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Clone)]
pub struct PushSubscriber {
    url: String,
    token: Option<String>,
    backoff: BackoffSettings,
}

impl PushSubscriber {
    pub fn new(url: impl Into<String>, token: Option<String>, backoff: BackoffSettings) -> Self {
        Self {
            url: url.into(),
            token,
            backoff,
        }
    }

    /// Connects, forwards events, and reconnects with backoff until the task
    /// running it is aborted.
    pub async fn run(self, handler: &dyn PushHandler) {
        let mut backoff = Backoff::new(self.backoff);
        loop {
            match self.session(handler, &mut backoff).await {
                Ok(()) => {
                    tracing::info!(url = %self.url, "push channel closed by server");
                }
                Err(err) => {
                    tracing::warn!(url = %self.url, error = %err, "push channel failed");
                }
            }
            let delay = backoff.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting push channel");
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(
        &self,
        handler: &dyn PushHandler,
        backoff: &mut Backoff,
    ) -> Result<(), PushError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| PushError::Request(err.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| PushError::Request(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut stream, _response) = connect_async(request).await?;
        backoff.reset();
        handler.on_connected();
        tracing::info!(url = %self.url, "push channel connected");

        let result = async {
            while let Some(message) = stream.next().await {
                match message? {
                    WsMessage::Text(text) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(event) => handler.on_event(event),
                            Err(err) => {
                                tracing::debug!(error = %err, "skipping unrecognised push event")
                            }
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            Ok::<(), PushError>(())
        }
        .await;

        handler.on_disconnected();
        result
    }
}
