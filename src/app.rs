use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bcrypt::verify;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::channel::{is_e164, reset_credentials_on_switch, ConfigDocument};
use crate::error::ApiError;
use crate::events::ServerEvent;
use crate::handoff::{self, EscalationReason, HandoffSignals};
use crate::patch::merge;
use crate::screen_share::{
    ScreenShareAction, ScreenShareInput, ScreenSharePhase, ScreenShareRegistry,
    ScreenShareSession,
};
use crate::settings::ServerSettings;
use crate::store::{MemoryStore, PgStore, Store};
use crate::templates::{render_auto_response, AutoResponseContext};
use crate::types::{
    Assignee, Attachment, AttachmentKind, ConfigEnvelope, Conversation, ConversationStatus,
    ConversationsEnvelope, EscalateResponse, InterceptBody, LiveChatConfig, LoginBody,
    LoginResponse, Message, MessageEnvelope, MessagesEnvelope, Participant, ProviderEvent,
    ProviderKind, ScreenShareEnvelope, ScreenShareFlags, Sender, Surface, TestCall, TestCallBody,
    TestCallEnvelope, UploadResponse, VoipConfig, WebhookAck,
};

pub const SIGNATURE_HEADER: &str = "x-provider-signature";
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[derive(Default)]
struct RealtimeState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
}

pub struct AppState {
    store: Arc<dyn Store>,
    settings: ServerSettings,
    realtime: Mutex<RealtimeState>,
    next_client_id: AtomicUsize,
    screen_shares: Mutex<ScreenShareRegistry>,
    // serializes read-modify-write of conversations and config documents
    mutation_lock: Mutex<()>,
    admin_tokens: RwLock<HashSet<String>>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, settings: ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            screen_shares: Mutex::new(ScreenShareRegistry::default()),
            mutation_lock: Mutex::new(()),
            admin_tokens: RwLock::new(HashSet::new()),
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<(), ApiError> {
    if state.settings.admin_password_hash.is_none() {
        return Ok(());
    }
    let token = bearer_token(headers)
        .or_else(|| query_token.map(str::to_string))
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    if state.admin_tokens.read().await.contains(&token) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid token"))
    }
}

fn verify_provider_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// `sha256=<hex>` signature a provider sends with a webhook body.
pub fn sign_provider_payload(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn media_extension_from_filename(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 10 {
        return None;
    }
    ext.chars()
        .all(|c| c.is_ascii_alphanumeric())
        .then_some(ext)
}

fn media_extension_from_mime(mime: &str) -> &'static str {
    let mt = mime.to_ascii_lowercase();
    if mt.contains("jpeg") || mt.contains("jpg") {
        "jpg"
    } else if mt.contains("png") {
        "png"
    } else if mt.contains("webp") {
        "webp"
    } else if mt.contains("gif") {
        "gif"
    } else if mt.contains("pdf") {
        "pdf"
    } else if mt.contains("wordprocessingml") {
        "docx"
    } else if mt.contains("spreadsheetml") {
        "xlsx"
    } else if mt.contains("msword") {
        "doc"
    } else if mt.contains("rtf") {
        "rtf"
    } else if mt.contains("csv") {
        "csv"
    } else if mt.contains("plain") {
        "txt"
    } else {
        "bin"
    }
}

fn media_content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "rtf" => "application/rtf",
        "csv" => "text/csv; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn is_safe_media_file_name(value: &str) -> bool {
    !value.is_empty()
        && !value.contains('/')
        && !value.contains('\\')
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    let text = text.trim();
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let mut cut = text.chars().take(LIMIT).collect::<String>();
    cut.push('…');
    cut
}

fn screen_share_notice(phase: ScreenSharePhase) -> &'static str {
    match phase {
        ScreenSharePhase::Inactive => "Screen share ended",
        ScreenSharePhase::PendingView => "Screen share requested",
        ScreenSharePhase::Viewing => "Viewing shared screen",
        ScreenSharePhase::PendingControl => "Remote control requested",
        ScreenSharePhase::Controlling => "Remote control granted",
    }
}

async fn emit(state: &AppState, event: ServerEvent) {
    let Some(payload) = event.to_payload() else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        rt.clients.values().cloned().collect::<Vec<_>>()
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn load_config<D: ConfigDocument>(state: &AppState) -> Result<D, ApiError> {
    let Some(doc) = state.store.load_document(D::KIND).await? else {
        return Ok(D::default());
    };
    serde_json::from_value(doc).map_err(|err| {
        tracing::error!(channel = ?D::KIND, error = %err, "stored configuration does not decode");
        ApiError::internal("stored configuration is invalid")
    })
}

/// Merges a partial document into the stored config. A provider switch
/// drops the previous provider's credentials before the merge.
async fn update_config<D: ConfigDocument>(state: &AppState, patch: Value) -> Result<D, ApiError> {
    if !patch.is_object() {
        return Err(ApiError::bad_request("config update must be a JSON object"));
    }
    let _guard = state.mutation_lock.lock().await;

    let mut doc = match state.store.load_document(D::KIND).await? {
        Some(doc) => doc,
        None => serde_json::to_value(D::default())
            .map_err(|err| ApiError::internal(err.to_string()))?,
    };
    reset_credentials_on_switch(&mut doc, &patch);
    merge(&mut doc, &patch);

    let mut config: D = serde_json::from_value(doc)
        .map_err(|err| ApiError::bad_request(format!("invalid configuration: {err}")))?;
    config.normalize();

    let stored = serde_json::to_value(&config).map_err(|err| ApiError::internal(err.to_string()))?;
    state.store.save_document(D::KIND, &stored).await?;
    tracing::info!(channel = ?D::KIND, "configuration updated");
    emit(state, ServerEvent::ConfigUpdated { channel: D::KIND }).await;
    Ok(config)
}

async fn find_conversation(state: &AppState, id: &str) -> Result<Conversation, ApiError> {
    state
        .store
        .get_conversation(id)
        .await?
        .ok_or_else(|| ApiError::not_found("conversation not found"))
}

async fn append_message(
    state: &AppState,
    conversation: &mut Conversation,
    sender: Sender,
    content: String,
    attachments: Vec<Attachment>,
    screen_share: Option<ScreenShareFlags>,
) -> Result<Message, ApiError> {
    let now = now_iso();
    let message = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        sender,
        content,
        attachments,
        screen_share,
        created_at: now.clone(),
    };
    state.store.append_message(&message).await?;

    conversation.message_count = conversation.message_count.saturating_add(1);
    conversation.has_attachments |= !message.attachments.is_empty();
    conversation.last_message = Some(preview(&message.content));
    conversation.updated_at = now;

    emit(state, ServerEvent::MessageCreated(message.clone())).await;
    Ok(message)
}

async fn save_conversation(state: &AppState, conversation: &Conversation) -> Result<(), ApiError> {
    state.store.upsert_conversation(conversation).await?;
    emit(state, ServerEvent::ConversationUpdated(conversation.clone())).await;
    Ok(())
}

fn auto_response(state: &AppState, template: &str, conversation: &Conversation) -> String {
    render_auto_response(
        template,
        &AutoResponseContext {
            name: &conversation.participant.name,
            source: conversation.source.as_str(),
            firm: &state.settings.firm_name,
        },
    )
}

/// Hands the conversation to a human. Returns `false` when it already is
/// with one; nothing is changed or posted in that case. The caller holds
/// the mutation lock and saves the conversation.
async fn escalate_locked(
    state: &AppState,
    conversation: &mut Conversation,
    reason: Option<&EscalationReason>,
    config: &LiveChatConfig,
) -> Result<bool, ApiError> {
    if conversation.assigned_to == Assignee::Human {
        return Ok(false);
    }
    if conversation.status == ConversationStatus::Closed {
        return Err(ApiError::conflict("conversation is closed"));
    }

    conversation.assigned_to = Assignee::Human;
    conversation.status = ConversationStatus::Pending;
    conversation.escalated_at = Some(now_iso());

    let notice = auto_response(state, &config.channel.auto_responses.escalation, conversation);
    if !notice.is_empty() {
        append_message(state, conversation, Sender::System, notice, vec![], None).await?;
    }

    let reason = reason
        .map(EscalationReason::describe)
        .unwrap_or_else(|| "operator request".to_string());
    tracing::info!(conversation_id = %conversation.id, %reason, "conversation escalated");
    Ok(true)
}

async fn apply_screen_share(
    state: &AppState,
    conversation: &mut Conversation,
    input: ScreenShareInput,
) -> Result<ScreenShareSession, ApiError> {
    let starting = matches!(
        input,
        ScreenShareInput::Action(ScreenShareAction::Start | ScreenShareAction::RequestControl)
    );
    if starting && conversation.status == ConversationStatus::Closed {
        return Err(ApiError::conflict("conversation is closed"));
    }

    let phase = {
        let mut registry = state.screen_shares.lock().await;
        registry
            .apply(&conversation.id, input)
            .map_err(|err| ApiError::conflict(err.to_string()))?
    };
    let session = ScreenShareSession::new(&conversation.id, phase, now_iso());
    conversation.screen_share_active = phase.is_active();
    conversation.screen_share_phase = phase;
    append_message(
        state,
        conversation,
        Sender::System,
        screen_share_notice(phase).to_string(),
        vec![],
        Some(phase.flags()),
    )
    .await?;

    tracing::info!(conversation_id = %conversation.id, ?phase, "screen share updated");
    emit(state, ServerEvent::ScreenShareUpdated(session.clone())).await;
    Ok(session)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(hash) = state.settings.admin_password_hash.as_deref() else {
        return Err(ApiError::not_found("admin login is not configured"));
    };
    if !verify(&body.password, hash).unwrap_or(false) {
        tracing::warn!("admin login rejected");
        return Err(ApiError::unauthorized("invalid password"));
    }
    let token = Uuid::new_v4().to_string();
    state.admin_tokens.write().await.insert(token.clone());
    Ok(Json(LoginResponse { token }))
}

async fn get_config<D: ConfigDocument>(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ConfigEnvelope<D>>, ApiError> {
    require_admin(&state, &headers, None).await?;
    let config = load_config::<D>(&state).await?;
    Ok(Json(ConfigEnvelope { config }))
}

async fn put_config<D: ConfigDocument>(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<Value>,
) -> Result<Json<ConfigEnvelope<D>>, ApiError> {
    require_admin(&state, &headers, None).await?;
    let config = update_config::<D>(&state, patch).await?;
    Ok(Json(ConfigEnvelope { config }))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ConversationsEnvelope>, ApiError> {
    require_admin(&state, &headers, None).await?;
    let conversations = state.store.list_conversations().await?;
    Ok(Json(ConversationsEnvelope { conversations }))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<MessagesEnvelope>, ApiError> {
    require_admin(&state, &headers, None).await?;
    find_conversation(&state, &conversation_id).await?;
    let messages = state.store.list_messages(&conversation_id).await?;
    Ok(Json(MessagesEnvelope { messages }))
}

async fn intercept(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<InterceptBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers, None).await?;
    let text = body.message.trim();
    if text.is_empty() {
        return Err(ApiError::bad_request("message is required"));
    }

    let _guard = state.mutation_lock.lock().await;
    let mut conversation = find_conversation(&state, &conversation_id).await?;
    if conversation.status == ConversationStatus::Closed {
        return Err(ApiError::conflict("conversation is closed"));
    }
    let message = append_message(
        &state,
        &mut conversation,
        Sender::Human,
        text.to_string(),
        vec![],
        None,
    )
    .await?;
    conversation.assigned_to = Assignee::Human;
    conversation.status = ConversationStatus::Active;
    save_conversation(&state, &conversation).await?;
    tracing::info!(conversation_id = %conversation.id, "operator message sent");

    Ok((StatusCode::CREATED, Json(MessageEnvelope { message })))
}

async fn escalate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<EscalateResponse>, ApiError> {
    require_admin(&state, &headers, None).await?;
    let _guard = state.mutation_lock.lock().await;
    let mut conversation = find_conversation(&state, &conversation_id).await?;
    let config = load_config::<LiveChatConfig>(&state).await?;
    let changed = escalate_locked(&state, &mut conversation, None, &config).await?;
    if changed {
        save_conversation(&state, &conversation).await?;
    }
    Ok(Json(EscalateResponse {
        conversation,
        changed,
    }))
}

#[derive(Debug, Deserialize)]
struct ScreenShareBody {
    action: ScreenShareAction,
}

async fn screen_share(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<ScreenShareBody>,
) -> Result<Json<ScreenShareEnvelope>, ApiError> {
    require_admin(&state, &headers, None).await?;
    let _guard = state.mutation_lock.lock().await;
    let mut conversation = find_conversation(&state, &conversation_id).await?;
    let session =
        apply_screen_share(&state, &mut conversation, ScreenShareInput::Action(body.action))
            .await?;
    save_conversation(&state, &conversation).await?;
    Ok(Json(ScreenShareEnvelope { session }))
}

async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers, None).await?;
    find_conversation(&state, &conversation_id).await?;

    let mut uploaded: Option<Attachment> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        if field.name().unwrap_or("") != "file" {
            continue;
        }
        let original_name = field.file_name().unwrap_or("").trim().to_string();
        let content_type = field
            .content_type()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let Some(kind) = AttachmentKind::from_mime(&content_type) else {
            return Err(ApiError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("{content_type} is not an image or document"),
            ));
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read upload: {err}")))?;
        if bytes.is_empty() {
            return Err(ApiError::bad_request("uploaded file is empty"));
        }

        let ext = media_extension_from_filename(&original_name)
            .unwrap_or_else(|| media_extension_from_mime(&content_type).to_string());
        let stored_name = format!("{}.{}", Uuid::new_v4(), ext);
        let path = state.settings.media_storage_dir.join(&stored_name);
        if let Err(err) = tokio::fs::write(&path, &bytes).await {
            tracing::error!(path = %path.display(), error = %err, "failed to store upload");
            return Err(ApiError::internal("failed to store uploaded file"));
        }

        uploaded = Some(Attachment {
            id: Uuid::new_v4().to_string(),
            file_name: if original_name.is_empty() {
                stored_name.clone()
            } else {
                original_name
            },
            mime_type: content_type,
            size_bytes: bytes.len() as u64,
            kind,
            url: format!("/api/media/{stored_name}"),
        });
        break;
    }

    let Some(attachment) = uploaded else {
        return Err(ApiError::bad_request("missing file field in multipart form"));
    };

    let _guard = state.mutation_lock.lock().await;
    let mut conversation = find_conversation(&state, &conversation_id).await?;
    let message = append_message(
        &state,
        &mut conversation,
        Sender::Human,
        attachment.file_name.clone(),
        vec![attachment.clone()],
        None,
    )
    .await?;
    save_conversation(&state, &conversation).await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            message,
            attachment,
        }),
    ))
}

async fn serve_media(
    State(state): State<Arc<AppState>>,
    Path(file_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_safe_media_file_name(&file_name) {
        return Err(ApiError::bad_request("invalid media file name"));
    }
    let path = state.settings.media_storage_dir.join(&file_name);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("media file not found"))?;

    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let mut response = axum::response::Response::new(axum::body::Body::from(bytes));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=3600"),
    );
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(media_content_type_from_extension(&ext)),
    );
    Ok(response)
}

async fn test_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TestCallBody>,
) -> Result<Json<TestCallEnvelope>, ApiError> {
    require_admin(&state, &headers, None).await?;
    let to = body.to.trim();
    if !is_e164(to) {
        return Err(ApiError::bad_request("`to` must be an E.164 phone number"));
    }
    let config = load_config::<VoipConfig>(&state).await?;
    if !config.is_enabled() {
        return Err(ApiError::conflict("VoIP channel is disabled"));
    }
    let missing = config.channel.provider.missing_credentials();
    if !missing.is_empty() {
        return Err(ApiError::unprocessable(format!(
            "missing provider credentials: {}",
            missing.join(", ")
        )));
    }

    let provider = config.channel.provider.kind;
    let call = TestCall {
        call_id: Uuid::new_v4().to_string(),
        status: "queued".to_string(),
        to: to.to_string(),
        provider,
    };
    tracing::info!(call_id = %call.call_id, provider = provider.label(), "test call queued");
    Ok(Json(TestCallEnvelope { call }))
}

fn new_conversation(
    id: Option<String>,
    participant: Option<Participant>,
    source: Option<Surface>,
) -> Conversation {
    let now = now_iso();
    let mut participant = participant.unwrap_or_default();
    if participant.name.trim().is_empty() {
        participant.name = "Visitor".to_string();
    }
    Conversation {
        id: id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        participant,
        status: ConversationStatus::Active,
        assigned_to: Assignee::Ai,
        message_count: 0,
        has_attachments: false,
        screen_share_active: false,
        screen_share_phase: ScreenSharePhase::Inactive,
        source: source.unwrap_or(Surface::Landing),
        last_message: None,
        escalated_at: None,
        created_at: now.clone(),
        updated_at: now,
    }
}

fn ai_reply_count(messages: &[Message]) -> u32 {
    let count = messages.iter().filter(|m| m.sender == Sender::Ai).count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

async fn on_visitor_message(
    state: &AppState,
    conversation_id: Option<String>,
    participant: Option<Participant>,
    source: Option<Surface>,
    content: String,
) -> Result<WebhookAck, ApiError> {
    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::bad_request("message content is required"));
    }
    let config = load_config::<LiveChatConfig>(state).await?;

    let existing = match conversation_id.as_deref() {
        Some(id) => state.store.get_conversation(id).await?,
        None => None,
    };
    let (mut conversation, is_new) = match existing {
        Some(conversation) if conversation.status == ConversationStatus::Closed => {
            return Err(ApiError::conflict("conversation is closed"));
        }
        Some(conversation) => (conversation, false),
        None => {
            let conversation = new_conversation(conversation_id, participant, source);
            state.store.upsert_conversation(&conversation).await?;
            tracing::info!(conversation_id = %conversation.id, "conversation started");
            (conversation, true)
        }
    };

    append_message(state, &mut conversation, Sender::User, content.clone(), vec![], None).await?;

    let mut escalated = false;
    if config.is_enabled() && conversation.assigned_to == Assignee::Ai {
        if is_new {
            let greeting = auto_response(state, config.channel.greeting_template(Utc::now()), &conversation);
            if !greeting.is_empty() {
                append_message(state, &mut conversation, Sender::System, greeting, vec![], None)
                    .await?;
            }
        }
        let messages = state.store.list_messages(&conversation.id).await?;
        let signals = HandoffSignals {
            visitor_text: Some(content.as_str()),
            ai_replies: ai_reply_count(&messages),
            ..HandoffSignals::default()
        };
        if let Some(reason) = handoff::evaluate(
            &config.channel.human_handoff,
            &config.channel.ai_settings,
            &signals,
        ) {
            escalated = escalate_locked(state, &mut conversation, Some(&reason), &config).await?;
        }
    }

    save_conversation(state, &conversation).await?;
    Ok(WebhookAck {
        conversation: Some(conversation),
        escalated,
    })
}

async fn on_ai_reply(
    state: &AppState,
    conversation_id: &str,
    content: String,
    confidence: Option<f64>,
) -> Result<WebhookAck, ApiError> {
    let mut conversation = find_conversation(state, conversation_id).await?;
    if conversation.status == ConversationStatus::Closed {
        return Err(ApiError::conflict("conversation is closed"));
    }
    if conversation.assigned_to == Assignee::Human {
        tracing::debug!(conversation_id, "dropping automated reply, a human has the conversation");
        return Ok(WebhookAck {
            conversation: Some(conversation),
            escalated: false,
        });
    }

    let config = load_config::<LiveChatConfig>(state).await?;
    let mut content = content;
    let mut reason = None;
    if config.is_enabled() {
        let signals = HandoffSignals {
            ai_confidence: confidence,
            ..HandoffSignals::default()
        };
        reason = handoff::evaluate(
            &config.channel.human_handoff,
            &config.channel.ai_settings,
            &signals,
        );
        let unsure = confidence
            .is_some_and(|value| value < config.channel.ai_settings.confidence_threshold);
        if reason.is_none() && unsure {
            let fallback = auto_response(state, &config.channel.auto_responses.fallback, &conversation);
            if !fallback.is_empty() {
                tracing::debug!(conversation_id, "low-confidence reply replaced by fallback");
                content = fallback;
            }
        }
    }

    append_message(state, &mut conversation, Sender::Ai, content, vec![], None).await?;

    let mut escalated = false;
    if let Some(reason) = reason {
        escalated = escalate_locked(state, &mut conversation, Some(&reason), &config).await?;
    }

    save_conversation(state, &conversation).await?;
    Ok(WebhookAck {
        conversation: Some(conversation),
        escalated,
    })
}

async fn provider_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !verify_provider_signature(&state.settings.webhook_secret, signature, &body) {
        tracing::warn!("provider webhook signature rejected");
        return Err(ApiError::unauthorized("invalid signature"));
    }
    let event: ProviderEvent = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid provider event: {err}")))?;

    let _guard = state.mutation_lock.lock().await;
    let ack = match event {
        ProviderEvent::VisitorMessage {
            conversation_id,
            participant,
            source,
            content,
        } => on_visitor_message(&state, conversation_id, participant, source, content).await?,
        ProviderEvent::AiReply {
            conversation_id,
            content,
            confidence,
        } => on_ai_reply(&state, &conversation_id, content, confidence).await?,
        ProviderEvent::ScreenShare {
            conversation_id,
            event,
        } => {
            let mut conversation = find_conversation(&state, &conversation_id).await?;
            apply_screen_share(&state, &mut conversation, ScreenShareInput::Remote(event))
                .await?;
            save_conversation(&state, &conversation).await?;
            WebhookAck {
                conversation: Some(conversation),
                escalated: false,
            }
        }
        ProviderEvent::ConversationClosed { conversation_id } => {
            let mut conversation = find_conversation(&state, &conversation_id).await?;
            if state.screen_shares.lock().await.end(&conversation_id) {
                let session =
                    ScreenShareSession::new(&conversation_id, ScreenSharePhase::Inactive, now_iso());
                emit(&state, ServerEvent::ScreenShareUpdated(session)).await;
            }
            conversation.status = ConversationStatus::Closed;
            conversation.screen_share_active = false;
            conversation.screen_share_phase = ScreenSharePhase::Inactive;
            conversation.updated_at = now_iso();
            save_conversation(&state, &conversation).await?;
            tracing::info!(conversation_id = %conversation.id, "conversation closed");
            WebhookAck {
                conversation: Some(conversation),
                escalated: false,
            }
        }
    };
    Ok(Json(ack))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    token: Option<String>,
}

async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers, query.token.as_deref()).await?;
    Ok(ws.on_upgrade(move |socket| handle_events_socket(socket, state)))
}

async fn handle_events_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.realtime.lock().await.clients.insert(client_id, tx);
    tracing::debug!(client_id, "push client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // inbound frames carry nothing; read until the client goes away
    while let Some(Ok(message)) = ws_receiver.next().await {
        if matches!(message, WsMessage::Close(_)) {
            break;
        }
    }

    state.realtime.lock().await.clients.remove(&client_id);
    send_task.abort();
    tracing::debug!(client_id, "push client disconnected");
}

/// Escalates conversations whose visitor has waited on an automated reply
/// longer than the configured timeout. Returns how many were escalated.
pub async fn sweep_waiting_conversations(
    state: &AppState,
    now: DateTime<Utc>,
) -> Result<usize, ApiError> {
    let _guard = state.mutation_lock.lock().await;
    let config = load_config::<LiveChatConfig>(state).await?;
    let rules = &config.channel.human_handoff;
    if !config.is_enabled() || !rules.enabled || rules.auto_escalate_after_secs == 0 {
        return Ok(0);
    }

    let mut escalated = 0;
    for mut conversation in state.store.list_conversations().await? {
        if conversation.assigned_to != Assignee::Ai
            || conversation.status == ConversationStatus::Closed
        {
            continue;
        }
        let messages = state.store.list_messages(&conversation.id).await?;
        let Some(last) = messages.iter().rev().find(|m| m.sender != Sender::System) else {
            continue;
        };
        if last.sender != Sender::User {
            continue;
        }
        let Ok(sent_at) = DateTime::parse_from_rfc3339(&last.created_at) else {
            continue;
        };
        let waited = (now - sent_at.with_timezone(&Utc)).num_seconds().max(0) as u64;
        let signals = HandoffSignals {
            waiting_secs: Some(waited),
            ..HandoffSignals::default()
        };
        let Some(reason) = handoff::evaluate(rules, &config.channel.ai_settings, &signals) else {
            continue;
        };
        if escalate_locked(state, &mut conversation, Some(&reason), &config).await? {
            save_conversation(state, &conversation).await?;
            escalated += 1;
        }
    }
    Ok(escalated)
}

pub fn spawn_escalation_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.settings.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_waiting_conversations(&state, Utc::now()).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "escalated waiting conversations"),
                Err(err) => tracing::warn!(error = %err, "escalation sweep failed"),
            }
        }
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let conversation = "/api/admin/livechat/conversations/{conversation_id}";
    Router::new()
        .route("/health", get(health))
        .route("/api/admin/login", post(login))
        .route(
            "/api/admin/livechat/config",
            get(get_config::<LiveChatConfig>).put(put_config::<LiveChatConfig>),
        )
        .route("/api/admin/livechat/conversations", get(list_conversations))
        .route(&format!("{conversation}/messages"), get(list_messages))
        .route(&format!("{conversation}/intercept"), post(intercept))
        .route(&format!("{conversation}/escalate"), post(escalate))
        .route(&format!("{conversation}/screen-share"), post(screen_share))
        .route(
            &format!("{conversation}/upload"),
            post(upload_attachment).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/admin/livechat/events", get(events_ws))
        .route(
            "/api/admin/voip/config",
            get(get_config::<VoipConfig>).put(put_config::<VoipConfig>),
        )
        .route("/api/admin/voip/test-call", post(test_call))
        .route("/api/livechat/provider/webhook", post(provider_webhook))
        .route("/api/media/{file_name}", get(serve_media))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = ServerSettings::from_env();
    tokio::fs::create_dir_all(&settings.media_storage_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create media storage directory {}",
                settings.media_storage_dir.display()
            )
        })?;

    let store: Arc<dyn Store> = match settings.database_url.as_deref() {
        Some(url) => Arc::new(
            PgStore::connect(url)
                .await
                .context("failed to connect to postgres")?,
        ),
        None => {
            tracing::warn!("DATABASE_URL is not set, conversations are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    if settings.admin_password_hash.is_none() {
        tracing::warn!("ADMIN_PASSWORD_HASH is not set, admin endpoints are open");
    }
    if settings.webhook_secret.is_empty() {
        tracing::warn!("PROVIDER_WEBHOOK_SECRET is not set, webhook signatures are not checked");
    }

    let port = settings.port;
    let state = AppState::new(store, settings);
    let _sweeper = spawn_escalation_sweeper(state.clone());
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(port, "livechat console server listening");
    axum::serve(listener, app)
        .await
        .context("server runtime failure")?;
    Ok(())
}
