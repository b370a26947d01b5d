//! Typed HTTP client for the admin API.

use std::sync::{Arc, RwLock};

use reqwest::{multipart, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::channel::{is_e164, ConfigDocument};
use crate::error::ClientError;
use crate::screen_share::{ScreenShareAction, ScreenShareSession};
use crate::types::{
    ConfigEnvelope, Conversation, ConversationsEnvelope, EscalateResponse, InterceptBody,
    LiveChatConfig, LoginBody, LoginResponse, Message, MessageEnvelope, MessagesEnvelope,
    ScreenShareEnvelope, TestCall, TestCallBody, TestCallEnvelope, UploadResponse, VoipConfig,
};

const LIVECHAT: &[&str] = &["api", "admin", "livechat"];

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Cheap to clone; clones share the bearer token.
#[derive(Debug, Clone)]
pub struct AdminClient {
    http: reqwest::Client,
    base_url: Url,
    token: Arc<RwLock<Option<String>>>,
}

impl AdminClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    pub fn with_http(http: reqwest::Client, base_url: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|err| ClientError::Validation(format!("invalid base url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Validation(format!(
                "invalid base url: {base_url}"
            )));
        }
        Ok(Self {
            http,
            base_url,
            token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|token| token.clone())
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn conversation_url(&self, conversation_id: &str, action: &str) -> Url {
        let mut segments: Vec<&str> = LIVECHAT.to_vec();
        segments.extend(["conversations", conversation_id, action]);
        self.url(&segments)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let request = match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(ClientError::Transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(ClientError::Transport)?;

        if !status.is_success() {
            let message = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).trim().to_string());
            let message = if message.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                message
            };
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes).map_err(|err| ClientError::Decode(err.to_string()))
    }

    /// Exchanges the admin password for a bearer token and keeps it for
    /// subsequent calls.
    pub async fn login(&self, password: &str) -> Result<String, ClientError> {
        let body = LoginBody {
            password: password.to_string(),
        };
        let response: LoginResponse = self
            .send(self.http.post(self.url(&["api", "admin", "login"])).json(&body))
            .await?;
        self.set_token(Some(response.token.clone()));
        Ok(response.token)
    }

    fn config_url<D: ConfigDocument>(&self) -> Url {
        let mut url = self.base_url.clone();
        let path = D::KIND.config_path().trim_start_matches('/');
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path.split('/'));
        }
        url
    }

    pub async fn config<D: ConfigDocument>(&self) -> Result<D, ClientError> {
        let envelope: ConfigEnvelope<D> = self.send(self.http.get(self.config_url::<D>())).await?;
        Ok(envelope.config)
    }

    /// Sends a partial document; the server merges it and returns the result.
    pub async fn update_config<D: ConfigDocument>(&self, patch: &Value) -> Result<D, ClientError> {
        if !patch.is_object() {
            return Err(ClientError::Validation(
                "config update must be a JSON object".to_string(),
            ));
        }
        let envelope: ConfigEnvelope<D> = self
            .send(self.http.put(self.config_url::<D>()).json(patch))
            .await?;
        Ok(envelope.config)
    }

    pub async fn livechat_config(&self) -> Result<LiveChatConfig, ClientError> {
        self.config().await
    }

    pub async fn voip_config(&self) -> Result<VoipConfig, ClientError> {
        self.config().await
    }

    pub async fn test_call(&self, to: &str) -> Result<TestCall, ClientError> {
        let to = to.trim();
        if !is_e164(to) {
            return Err(ClientError::Validation(format!(
                "{to:?} is not an E.164 phone number"
            )));
        }
        let body = TestCallBody { to: to.to_string() };
        let envelope: TestCallEnvelope = self
            .send(
                self.http
                    .post(self.url(&["api", "admin", "voip", "test-call"]))
                    .json(&body),
            )
            .await?;
        Ok(envelope.call)
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        let mut segments: Vec<&str> = LIVECHAT.to_vec();
        segments.push("conversations");
        let envelope: ConversationsEnvelope = self.send(self.http.get(self.url(&segments))).await?;
        Ok(envelope.conversations)
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, ClientError> {
        let envelope: MessagesEnvelope = self
            .send(self.http.get(self.conversation_url(conversation_id, "messages")))
            .await?;
        Ok(envelope.messages)
    }

    pub async fn intercept(&self, conversation_id: &str, text: &str) -> Result<Message, ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::Validation("message must not be empty".to_string()));
        }
        let body = InterceptBody {
            message: text.to_string(),
        };
        let envelope: MessageEnvelope = self
            .send(
                self.http
                    .post(self.conversation_url(conversation_id, "intercept"))
                    .json(&body),
            )
            .await?;
        Ok(envelope.message)
    }

    pub async fn escalate(&self, conversation_id: &str) -> Result<EscalateResponse, ClientError> {
        self.send(self.http.post(self.conversation_url(conversation_id, "escalate")))
            .await
    }

    pub async fn screen_share(
        &self,
        conversation_id: &str,
        action: ScreenShareAction,
    ) -> Result<ScreenShareSession, ClientError> {
        let envelope: ScreenShareEnvelope = self
            .send(
                self.http
                    .post(self.conversation_url(conversation_id, "screen-share"))
                    .json(&json!({ "action": action })),
            )
            .await?;
        Ok(envelope.session)
    }

    pub async fn upload(
        &self,
        conversation_id: &str,
        file: UploadFile,
    ) -> Result<UploadResponse, ClientError> {
        if file.bytes.is_empty() {
            return Err(ClientError::Validation(format!(
                "{} is empty",
                file.file_name
            )));
        }
        let part = multipart::Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime_type)
            .map_err(ClientError::Transport)?;
        let form = multipart::Form::new().part("file", part);
        self.send(
            self.http
                .post(self.conversation_url(conversation_id, "upload"))
                .multipart(form),
        )
        .await
    }

    /// Websocket URL of the push channel.
    pub fn events_url(&self) -> String {
        let mut segments: Vec<&str> = LIVECHAT.to_vec();
        segments.push("events");
        let mut url = self.url(&segments);
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        let _ = url.set_scheme(scheme);
        url.to_string()
    }
}
