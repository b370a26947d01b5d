use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::permissions::PermissionSet;
use crate::screen_share::{RemoteScreenShareEvent, ScreenSharePhase, ScreenShareSession};

/// A provider plugin for one communication channel. Each provider declares
/// the credential fields it needs; switching providers resets to exactly
/// that set of fields.
pub trait ProviderKind:
    Copy + Eq + std::fmt::Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn credential_fields(self) -> &'static [&'static str];
    fn label(self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatProvider {
    #[default]
    Intercom,
    Zendesk,
    Crisp,
    Tawk,
    Custom,
}

impl ProviderKind for ChatProvider {
    fn credential_fields(self) -> &'static [&'static str] {
        match self {
            ChatProvider::Intercom => &["appId", "accessToken"],
            ChatProvider::Zendesk => &["subdomain", "email", "apiToken"],
            ChatProvider::Crisp => &["websiteId", "identifier", "key"],
            ChatProvider::Tawk => &["propertyId", "widgetId", "apiKey"],
            ChatProvider::Custom => &["endpoint", "apiKey"],
        }
    }

    fn label(self) -> &'static str {
        match self {
            ChatProvider::Intercom => "intercom",
            ChatProvider::Zendesk => "zendesk",
            ChatProvider::Crisp => "crisp",
            ChatProvider::Tawk => "tawk",
            ChatProvider::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoipProvider {
    #[default]
    Twilio,
    Vonage,
    Plivo,
    Custom,
}

impl ProviderKind for VoipProvider {
    fn credential_fields(self) -> &'static [&'static str] {
        match self {
            VoipProvider::Twilio => &["accountSid", "authToken", "phoneNumber"],
            VoipProvider::Vonage => &["apiKey", "apiSecret", "applicationId", "phoneNumber"],
            VoipProvider::Plivo => &["authId", "authToken", "phoneNumber"],
            VoipProvider::Custom => &["sipUri", "username", "password", "phoneNumber"],
        }
    }

    fn label(self) -> &'static str {
        match self {
            VoipProvider::Twilio => "twilio",
            VoipProvider::Vonage => "vonage",
            VoipProvider::Plivo => "plivo",
            VoipProvider::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings<P> {
    #[serde(rename = "type")]
    pub kind: P,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

impl<P: ProviderKind> ProviderSettings<P> {
    pub fn empty(kind: P) -> Self {
        Self {
            kind,
            credentials: kind
                .credential_fields()
                .iter()
                .map(|field| (field.to_string(), String::new()))
                .collect(),
        }
    }
}

impl<P: ProviderKind> Default for ProviderSettings<P> {
    fn default() -> Self {
        Self::empty(P::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
        Day::Saturday,
        Day::Sunday,
    ];

    pub fn previous(self) -> Day {
        match self {
            Day::Monday => Day::Sunday,
            Day::Tuesday => Day::Monday,
            Day::Wednesday => Day::Tuesday,
            Day::Thursday => Day::Wednesday,
            Day::Friday => Day::Thursday,
            Day::Saturday => Day::Friday,
            Day::Sunday => Day::Saturday,
        }
    }
}

impl From<chrono::Weekday> for Day {
    fn from(value: chrono::Weekday) -> Self {
        match value {
            chrono::Weekday::Mon => Day::Monday,
            chrono::Weekday::Tue => Day::Tuesday,
            chrono::Weekday::Wed => Day::Wednesday,
            chrono::Weekday::Thu => Day::Thursday,
            chrono::Weekday::Fri => Day::Friday,
            chrono::Weekday::Sat => Day::Saturday,
            chrono::Weekday::Sun => Day::Sunday,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub active: bool,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkingHours {
    pub timezone: String,
    pub days: BTreeMap<Day, DaySchedule>,
}

impl Default for WorkingHours {
    fn default() -> Self {
        let days = Day::ALL
            .into_iter()
            .map(|day| {
                let weekend = matches!(day, Day::Saturday | Day::Sunday);
                (
                    day,
                    DaySchedule {
                        active: !weekend,
                        start: "09:00".to_string(),
                        end: "17:00".to_string(),
                    },
                )
            })
            .collect();
        Self {
            timezone: "UTC".to_string(),
            days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoResponses {
    pub welcome: String,
    pub after_hours: String,
    pub escalation: String,
    pub fallback: String,
}

impl Default for AutoResponses {
    fn default() -> Self {
        Self {
            welcome: "Hello {{ name }}, thanks for reaching out. How can we help you today?"
                .to_string(),
            after_hours: "Hi {{ name }}, our office is currently closed. Leave a message and a member of our team will follow up during business hours."
                .to_string(),
            escalation: "Connecting you with a member of our team. Please hold on.".to_string(),
            fallback: "I'm not sure I understood that. Could you rephrase?".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HumanHandoff {
    pub enabled: bool,
    pub trigger_keywords: Vec<String>,
    pub escalation_threshold: u32,
    pub forward_emails: Vec<String>,
    pub forward_numbers: Vec<String>,
    pub auto_escalate_after_secs: u64,
}

impl Default for HumanHandoff {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_keywords: vec![
                "human".to_string(),
                "attorney".to_string(),
                "lawyer".to_string(),
                "speak to someone".to_string(),
            ],
            escalation_threshold: 3,
            forward_emails: vec![],
            forward_numbers: vec![],
            auto_escalate_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiSettings {
    pub confidence_threshold: f64,
    pub max_response_time_secs: u64,
    pub fallback_to_human: bool,
    pub temperature: f64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_response_time_secs: 30,
            fallback_to_human: true,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    rename_all = "camelCase",
    default,
    bound(serialize = "P: Serialize", deserialize = "P: ProviderKind")
)]
pub struct ChannelConfig<P> {
    pub enabled: bool,
    pub provider: ProviderSettings<P>,
    pub working_hours: WorkingHours,
    pub auto_responses: AutoResponses,
    pub human_handoff: HumanHandoff,
    pub ai_settings: AiSettings,
}

impl<P: ProviderKind> Default for ChannelConfig<P> {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: ProviderSettings::default(),
            working_hours: WorkingHours::default(),
            auto_responses: AutoResponses::default(),
            human_handoff: HumanHandoff::default(),
            ai_settings: AiSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatConfig {
    #[serde(flatten)]
    pub channel: ChannelConfig<ChatProvider>,
    #[serde(default = "PermissionSet::dashboard_defaults")]
    pub dashboard_permissions: PermissionSet,
    #[serde(default = "PermissionSet::landing_defaults")]
    pub landing_permissions: PermissionSet,
}

impl Default for LiveChatConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            dashboard_permissions: PermissionSet::dashboard_defaults(),
            landing_permissions: PermissionSet::landing_defaults(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceSettings {
    pub voice: String,
    pub speed: f64,
    pub pitch: f64,
    pub volume: f64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "en-US-standard".to_string(),
            speed: 1.0,
            pitch: 1.0,
            volume: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoipConfig {
    #[serde(flatten)]
    pub channel: ChannelConfig<VoipProvider>,
    #[serde(default)]
    pub voice: VoiceSettings,
    #[serde(default)]
    pub record_calls: bool,
}

/// The two configurable communication channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Livechat,
    Voip,
}

impl ChannelKind {
    pub fn config_path(self) -> &'static str {
        match self {
            ChannelKind::Livechat => "/api/admin/livechat/config",
            ChannelKind::Voip => "/api/admin/voip/config",
        }
    }
}

/// Which surface a conversation (or a permission set) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Dashboard,
    Landing,
}

impl Surface {
    pub fn as_str(self) -> &'static str {
        match self {
            Surface::Dashboard => "dashboard",
            Surface::Landing => "landing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Pending,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assignee {
    Ai,
    Human,
    Unassigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
    Human,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participant: Participant,
    pub status: ConversationStatus,
    pub assigned_to: Assignee,
    pub message_count: u32,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub screen_share_active: bool,
    #[serde(default)]
    pub screen_share_phase: ScreenSharePhase,
    pub source: Surface,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
}

impl AttachmentKind {
    /// Images and office/PDF/text documents are accepted; everything else is not.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mt = mime.trim().to_ascii_lowercase();
        if mt.starts_with("image/") {
            return Some(AttachmentKind::Image);
        }
        let document = mt == "application/pdf"
            || mt == "application/msword"
            || mt == "application/rtf"
            || mt.starts_with("application/vnd.openxmlformats-officedocument.")
            || mt.starts_with("application/vnd.oasis.opendocument.")
            || mt.starts_with("text/plain")
            || mt.starts_with("text/csv");
        document.then_some(AttachmentKind::Document)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub kind: AttachmentKind,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareFlags {
    pub active: bool,
    pub has_control: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_share: Option<ScreenShareFlags>,
    pub created_at: String,
}

// Request bodies.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptBody {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginBody {
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCallBody {
    pub to: String,
}

/// Events posted by the chat provider plugin to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProviderEvent {
    VisitorMessage {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        participant: Option<Participant>,
        #[serde(default)]
        source: Option<Surface>,
        content: String,
    },
    AiReply {
        conversation_id: String,
        content: String,
        #[serde(default)]
        confidence: Option<f64>,
    },
    ScreenShare {
        conversation_id: String,
        event: RemoteScreenShareEvent,
    },
    ConversationClosed {
        conversation_id: String,
    },
}

// Response envelopes.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEnvelope<T> {
    pub config: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsEnvelope {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesEnvelope {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalateResponse {
    pub conversation: Conversation,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareEnvelope {
    pub session: ScreenShareSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: Message,
    pub attachment: Attachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCall {
    pub call_id: String,
    pub status: String,
    pub to: String,
    pub provider: VoipProvider,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCallEnvelope {
    pub call: TestCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub conversation: Option<Conversation>,
    pub escalated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn live_chat_config_fills_missing_sections_with_defaults() {
        let config: LiveChatConfig = serde_json::from_value(json!({
            "enabled": true,
            "provider": { "type": "crisp" }
        }))
        .expect("partial config should decode");

        assert!(config.channel.enabled);
        assert_eq!(config.channel.provider.kind, ChatProvider::Crisp);
        assert!(config.channel.provider.credentials.is_empty());
        assert_eq!(config.channel.human_handoff.escalation_threshold, 3);
        assert_eq!(config.channel.working_hours.days.len(), 7);
    }

    #[test]
    fn escalation_threshold_zero_decodes_literally() {
        let config: LiveChatConfig = serde_json::from_value(json!({
            "humanHandoff": { "escalationThreshold": 0 }
        }))
        .expect("config should decode");
        assert_eq!(config.channel.human_handoff.escalation_threshold, 0);
        assert!(config.channel.human_handoff.enabled);
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let err = serde_json::from_value::<Conversation>(json!({
            "id": "c1",
            "participant": { "name": "Ann" },
            "status": "snoozed",
            "assignedTo": "ai",
            "messageCount": 0,
            "source": "landing",
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        }))
        .expect_err("unknown status must not fall through");
        assert!(err.to_string().contains("snoozed"));
    }

    #[test]
    fn provider_event_uses_snake_case_tags_and_camel_case_fields() {
        let event: ProviderEvent = serde_json::from_value(json!({
            "type": "ai_reply",
            "conversationId": "c1",
            "content": "hi",
            "confidence": 0.4
        }))
        .expect("event should decode");
        assert_eq!(
            event,
            ProviderEvent::AiReply {
                conversation_id: "c1".to_string(),
                content: "hi".to_string(),
                confidence: Some(0.4),
            }
        );
    }

    #[test]
    fn attachment_kind_accepts_images_and_documents_only() {
        assert_eq!(AttachmentKind::from_mime("image/png"), Some(AttachmentKind::Image));
        assert_eq!(
            AttachmentKind::from_mime("application/pdf"),
            Some(AttachmentKind::Document)
        );
        assert_eq!(AttachmentKind::from_mime("video/mp4"), None);
        assert_eq!(AttachmentKind::from_mime("application/x-msdownload"), None);
    }
}
