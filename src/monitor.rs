//! Near-real-time view of live conversations with supervisor actions.
//!
//! The conversation list refreshes every `list_interval` while the monitor is
//! open; the selected conversation's messages refresh every
//! `detail_interval`. Both loops also refresh immediately when their query is
//! invalidated. While the push channel is connected, timer ticks are skipped
//! and only invalidations trigger fetches.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::client::{AdminClient, UploadFile};
use crate::error::ClientError;
use crate::events::{PushHandler, PushSubscriber, ServerEvent};
use crate::notify::{Action, Notifier};
use crate::screen_share::{ScreenShareAction, ScreenSharePhase, ScreenShareSession};
use crate::settings::MonitorSettings;
use crate::types::{AttachmentKind, Conversation, EscalateResponse, Message, UploadResponse};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorView {
    pub open: bool,
    pub conversations: Vec<Conversation>,
    pub selected: Option<String>,
    /// Messages of `selected`; never another conversation's.
    pub messages: Vec<Message>,
    /// Server-confirmed sessions that are not inactive.
    pub screen_shares: HashMap<String, ScreenShareSession>,
    pub uploads_in_flight: HashSet<String>,
    pub escalations_in_flight: HashSet<String>,
    pub push_connected: bool,
}

impl MonitorView {
    pub fn can_upload(&self, conversation_id: &str) -> bool {
        !self.uploads_in_flight.contains(conversation_id)
    }

    pub fn can_escalate(&self, conversation_id: &str) -> bool {
        !self.escalations_in_flight.contains(conversation_id)
    }

    pub fn screen_share_phase(&self, conversation_id: &str) -> ScreenSharePhase {
        self.screen_shares
            .get(conversation_id)
            .map(|session| session.phase)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKey {
    Conversations,
    Messages(String),
}

#[derive(Debug, Clone, Copy)]
enum Gate {
    Upload,
    Escalate,
}

impl Gate {
    fn set(self, view: &mut MonitorView) -> &mut HashSet<String> {
        match self {
            Gate::Upload => &mut view.uploads_in_flight,
            Gate::Escalate => &mut view.escalations_in_flight,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Gate::Upload => "upload",
            Gate::Escalate => "escalation",
        }
    }
}

/// Holds a conversation's slot in an in-flight set until dropped.
struct InFlight<'a> {
    view: &'a watch::Sender<MonitorView>,
    gate: Gate,
    conversation_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let gate = self.gate;
        let id = &self.conversation_id;
        self.view.send_modify(|view| {
            gate.set(view).remove(id);
        });
    }
}

/// Applies a detail response if it still belongs to the current selection.
fn apply_detail(
    view: &mut MonitorView,
    current_generation: u64,
    conversation_id: &str,
    generation: u64,
    messages: Vec<Message>,
) -> bool {
    if generation != current_generation || view.selected.as_deref() != Some(conversation_id) {
        return false;
    }
    if view.messages == messages {
        return false;
    }
    view.messages = messages;
    true
}

/// Brings the screen-share sessions of listed conversations in line with
/// the phase the server reported for them.
fn reconcile_screen_shares(view: &mut MonitorView, conversations: &[Conversation]) -> bool {
    let mut changed = false;
    for conversation in conversations {
        let phase = conversation.screen_share_phase;
        if phase == ScreenSharePhase::Inactive {
            changed |= view.screen_shares.remove(&conversation.id).is_some();
            continue;
        }
        if view.screen_share_phase(&conversation.id) == phase {
            continue;
        }
        view.screen_shares.insert(
            conversation.id.clone(),
            ScreenShareSession::new(&conversation.id, phase, conversation.updated_at.clone()),
        );
        changed = true;
    }
    changed
}

#[derive(Default)]
struct Tasks {
    list: Option<JoinHandle<()>>,
    detail: Option<JoinHandle<()>>,
    push: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [self.list.take(), self.detail.take(), self.push.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    client: AdminClient,
    settings: MonitorSettings,
    notifier: Notifier,
    view: watch::Sender<MonitorView>,
    list_refresh: Notify,
    detail_refresh: Notify,
    detail_generation: AtomicU64,
    push_connected: AtomicBool,
}

impl Inner {
    fn invalidate(&self, key: &QueryKey) {
        match key {
            QueryKey::Conversations => {
                if self.view.borrow().open {
                    self.list_refresh.notify_one();
                }
            }
            QueryKey::Messages(id) => {
                if self.view.borrow().selected.as_deref() == Some(id.as_str()) {
                    self.detail_refresh.notify_one();
                }
            }
        }
    }

    async fn refresh_conversations(&self) {
        tracing::debug!("fetching conversations");
        match self.client.conversations().await {
            Ok(conversations) => {
                self.view.send_if_modified(|view| {
                    if !view.open {
                        return false;
                    }
                    let shares_changed = reconcile_screen_shares(view, &conversations);
                    if view.conversations == conversations {
                        return shares_changed;
                    }
                    view.conversations = conversations;
                    true
                });
            }
            Err(err) => tracing::warn!(error = %err, "conversation list refresh failed"),
        }
    }

    async fn refresh_messages(&self, conversation_id: &str, generation: u64) {
        tracing::debug!(conversation_id, "fetching messages");
        match self.client.messages(conversation_id).await {
            Ok(messages) => {
                self.view.send_if_modified(|view| {
                    let current = self.detail_generation.load(Ordering::SeqCst);
                    apply_detail(view, current, conversation_id, generation, messages)
                });
            }
            Err(err) => {
                tracing::warn!(conversation_id, error = %err, "message refresh failed")
            }
        }
    }

    fn try_enter(&self, gate: Gate, conversation_id: &str) -> Result<InFlight<'_>, ClientError> {
        let entered = self
            .view
            .send_if_modified(|view| gate.set(view).insert(conversation_id.to_string()));
        if !entered {
            return Err(ClientError::InFlight {
                action: gate.name(),
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(InFlight {
            view: &self.view,
            gate,
            conversation_id: conversation_id.to_string(),
        })
    }

    fn record_screen_share(&self, session: ScreenShareSession) {
        self.view.send_modify(|view| {
            if session.phase == ScreenSharePhase::Inactive {
                view.screen_shares.remove(&session.conversation_id);
            } else {
                view.screen_shares
                    .insert(session.conversation_id.clone(), session);
            }
        });
    }

    fn set_push_connected(&self, connected: bool) {
        self.push_connected.store(connected, Ordering::SeqCst);
        self.view.send_if_modified(|view| {
            let changed = view.push_connected != connected;
            view.push_connected = connected;
            changed
        });
    }

    fn selected(&self) -> Option<String> {
        self.view.borrow().selected.clone()
    }
}

impl PushHandler for Inner {
    fn on_connected(&self) {
        self.set_push_connected(true);
        // catch up on anything missed while disconnected
        self.invalidate(&QueryKey::Conversations);
        if let Some(id) = self.selected() {
            self.invalidate(&QueryKey::Messages(id));
        }
    }

    fn on_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ConversationUpdated(conversation) => {
                self.invalidate(&QueryKey::Conversations);
                self.invalidate(&QueryKey::Messages(conversation.id));
            }
            ServerEvent::MessageCreated(message) => {
                self.invalidate(&QueryKey::Messages(message.conversation_id));
            }
            ServerEvent::ScreenShareUpdated(session) => {
                self.record_screen_share(session);
                self.invalidate(&QueryKey::Conversations);
            }
            ServerEvent::ConfigUpdated { channel } => {
                tracing::debug!(?channel, "config updated elsewhere");
            }
        }
    }

    fn on_disconnected(&self) {
        self.set_push_connected(false);
    }
}

async fn list_loop(inner: Arc<Inner>) {
    let mut timer_tick = false;
    loop {
        if !(timer_tick && inner.push_connected.load(Ordering::SeqCst)) {
            inner.refresh_conversations().await;
        }
        timer_tick = tokio::select! {
            _ = tokio::time::sleep(inner.settings.list_interval) => true,
            _ = inner.list_refresh.notified() => false,
        };
    }
}

async fn detail_loop(inner: Arc<Inner>, conversation_id: String, generation: u64) {
    let mut timer_tick = false;
    loop {
        if !(timer_tick && inner.push_connected.load(Ordering::SeqCst)) {
            inner.refresh_messages(&conversation_id, generation).await;
        }
        timer_tick = tokio::select! {
            _ = tokio::time::sleep(inner.settings.detail_interval) => true,
            _ = inner.detail_refresh.notified() => false,
        };
    }
}

/// Supervisor console over the admin API. Dropping it stops every
/// background task it started.
pub struct ConversationMonitor {
    inner: Arc<Inner>,
    tasks: Mutex<Tasks>,
}

impl ConversationMonitor {
    pub fn new(client: AdminClient, settings: MonitorSettings, notifier: Notifier) -> Self {
        let (view, _) = watch::channel(MonitorView::default());
        Self {
            inner: Arc::new(Inner {
                client,
                settings,
                notifier,
                view,
                list_refresh: Notify::new(),
                detail_refresh: Notify::new(),
                detail_generation: AtomicU64::new(0),
                push_connected: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> MonitorView {
        self.inner.view.borrow().clone()
    }

    fn with_tasks(&self, f: impl FnOnce(&mut Tasks)) {
        match self.tasks.lock() {
            Ok(mut tasks) => f(&mut tasks),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Starts the list subscription. Opening an open monitor does nothing.
    pub fn open(&self) {
        self.with_tasks(|tasks| {
            if tasks.list.is_some() {
                return;
            }
            self.inner.view.send_modify(|view| view.open = true);
            tasks.list = Some(tokio::spawn(list_loop(self.inner.clone())));
        });
    }

    /// Stops every subscription and forgets the selection.
    pub fn close(&self) {
        self.with_tasks(|tasks| {
            for task in [tasks.list.take(), tasks.detail.take()].into_iter().flatten() {
                task.abort();
            }
        });
        self.inner.detail_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.view.send_modify(|view| {
            view.open = false;
            view.selected = None;
            view.messages.clear();
        });
    }

    /// Replaces the detail subscription with one for `conversation_id`.
    /// Responses still in flight for the previous selection are discarded.
    pub fn select(&self, conversation_id: &str) {
        let generation = self.inner.detail_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.view.send_modify(|view| {
            view.selected = Some(conversation_id.to_string());
            view.messages.clear();
        });
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        self.with_tasks(|tasks| {
            if let Some(previous) = tasks.detail.take() {
                previous.abort();
            }
            tasks.detail = Some(tokio::spawn(detail_loop(inner, id, generation)));
        });
    }

    pub fn clear_selection(&self) {
        self.inner.detail_generation.fetch_add(1, Ordering::SeqCst);
        self.with_tasks(|tasks| {
            if let Some(previous) = tasks.detail.take() {
                previous.abort();
            }
        });
        self.inner.view.send_modify(|view| {
            view.selected = None;
            view.messages.clear();
        });
    }

    /// Refetches the query now if it is subscribed.
    pub fn invalidate(&self, key: QueryKey) {
        self.inner.invalidate(&key);
    }

    /// Sends `text` into the conversation as the operator. On failure the
    /// caller keeps its input so the operator can retry.
    pub async fn intercept(&self, conversation_id: &str, text: &str) -> Result<Message, ClientError> {
        match self.inner.client.intercept(conversation_id, text).await {
            Ok(message) => {
                tracing::info!(conversation_id, "operator intercepted conversation");
                self.invalidate(QueryKey::Messages(conversation_id.to_string()));
                self.invalidate(QueryKey::Conversations);
                Ok(message)
            }
            Err(err) => {
                self.inner.notifier.report(Action::SendMessage, &err);
                Err(err)
            }
        }
    }

    /// Hands the conversation to a human. A second call while one is in
    /// flight for the same conversation is refused locally; repeated calls
    /// after it completes are absorbed by the server.
    pub async fn escalate(&self, conversation_id: &str) -> Result<EscalateResponse, ClientError> {
        let result = match self.inner.try_enter(Gate::Escalate, conversation_id) {
            Ok(_slot) => self.inner.client.escalate(conversation_id).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(response) => {
                tracing::info!(conversation_id, changed = response.changed, "escalation sent");
                self.invalidate(QueryKey::Conversations);
                self.invalidate(QueryKey::Messages(conversation_id.to_string()));
                Ok(response)
            }
            Err(err) => {
                self.inner.notifier.report(Action::Escalate, &err);
                Err(err)
            }
        }
    }

    /// Requests a screen-share transition. The view reflects the session
    /// state the server reports, which for `start` and `request_control` is
    /// a pending phase until the remote party answers.
    pub async fn screen_share(
        &self,
        conversation_id: &str,
        action: ScreenShareAction,
    ) -> Result<ScreenShareSession, ClientError> {
        match self.inner.client.screen_share(conversation_id, action).await {
            Ok(session) => {
                self.inner.record_screen_share(session.clone());
                self.invalidate(QueryKey::Conversations);
                self.invalidate(QueryKey::Messages(conversation_id.to_string()));
                Ok(session)
            }
            Err(err) => {
                self.inner.notifier.report(Action::ScreenShare, &err);
                Err(err)
            }
        }
    }

    /// Uploads an image or document. Only one upload per conversation may be
    /// in flight; other conversations are unaffected.
    pub async fn upload(
        &self,
        conversation_id: &str,
        file: UploadFile,
    ) -> Result<UploadResponse, ClientError> {
        let result = if AttachmentKind::from_mime(&file.mime_type).is_none() {
            Err(ClientError::Validation(format!(
                "{} is not an image or document",
                file.mime_type
            )))
        } else {
            match self.inner.try_enter(Gate::Upload, conversation_id) {
                Ok(_slot) => self.inner.client.upload(conversation_id, file).await,
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(response) => {
                self.invalidate(QueryKey::Messages(conversation_id.to_string()));
                self.invalidate(QueryKey::Conversations);
                Ok(response)
            }
            Err(err) => {
                self.inner.notifier.report(Action::Upload, &err);
                Err(err)
            }
        }
    }

    /// Subscribes to the server push channel. While it is connected, timer
    /// polls are skipped; if it drops, polling resumes until it reconnects.
    pub fn attach_push(&self) {
        let subscriber = PushSubscriber::new(
            self.inner.client.events_url(),
            self.inner.client.token(),
            self.inner.settings.backoff,
        );
        let inner = self.inner.clone();
        self.with_tasks(|tasks| {
            if tasks.push.is_some() {
                return;
            }
            tasks.push = Some(tokio::spawn(async move {
                subscriber.run(inner.as_ref()).await;
            }));
        });
    }

    pub fn detach_push(&self) {
        self.with_tasks(|tasks| {
            if let Some(task) = tasks.push.take() {
                task.abort();
            }
        });
        self.inner.set_push_connected(false);
    }
}

impl Drop for ConversationMonitor {
    fn drop(&mut self) {
        self.with_tasks(Tasks::abort_all);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sender;

    fn message(id: &str, conversation_id: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: Sender::User,
            content: "hi".to_string(),
            attachments: vec![],
            screen_share: None,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn stale_detail_responses_are_discarded() {
        let mut view = MonitorView {
            selected: Some("b".to_string()),
            ..MonitorView::default()
        };
        // late response for the previous selection
        assert!(!apply_detail(&mut view, 2, "a", 1, vec![message("m1", "a")]));
        // same conversation, older subscription
        assert!(!apply_detail(&mut view, 3, "b", 2, vec![message("m2", "b")]));
        assert!(view.messages.is_empty());

        assert!(apply_detail(&mut view, 3, "b", 3, vec![message("m3", "b")]));
        assert_eq!(view.messages[0].id, "m3");
    }

    #[tokio::test]
    async fn in_flight_gate_is_per_conversation() {
        let monitor = ConversationMonitor::new(
            AdminClient::new("http://127.0.0.1:9").expect("client"),
            MonitorSettings::default(),
            Notifier::default(),
        );
        let inner = &monitor.inner;
        let slot = inner.try_enter(Gate::Upload, "x").expect("first upload");
        assert!(!monitor.view().can_upload("x"));
        assert!(monitor.view().can_upload("y"));
        assert!(matches!(
            inner.try_enter(Gate::Upload, "x"),
            Err(ClientError::InFlight { .. })
        ));
        let other = inner.try_enter(Gate::Upload, "y").expect("other conversation");
        assert!(monitor.view().can_escalate("x"));
        drop(slot);
        assert!(monitor.view().can_upload("x"));
        drop(other);
        assert!(monitor.view().uploads_in_flight.is_empty());
    }

    #[tokio::test]
    async fn pushed_screen_share_updates_replace_local_state() {
        let monitor = ConversationMonitor::new(
            AdminClient::new("http://127.0.0.1:9").expect("client"),
            MonitorSettings::default(),
            Notifier::default(),
        );
        monitor
            .inner
            .on_event(ServerEvent::ScreenShareUpdated(ScreenShareSession::new(
                "c1",
                ScreenSharePhase::Viewing,
                "2026-01-01T00:00:00+00:00".to_string(),
            )));
        assert_eq!(monitor.view().screen_share_phase("c1"), ScreenSharePhase::Viewing);

        monitor
            .inner
            .on_event(ServerEvent::ScreenShareUpdated(ScreenShareSession::new(
                "c1",
                ScreenSharePhase::Inactive,
                "2026-01-01T00:00:01+00:00".to_string(),
            )));
        assert!(monitor.view().screen_shares.is_empty());
    }

    #[tokio::test]
    async fn unsupported_upload_type_is_refused_and_reported() {
        let notifier = Notifier::default();
        let mut notices = notifier.subscribe();
        let monitor = ConversationMonitor::new(
            AdminClient::new("http://127.0.0.1:9").expect("client"),
            MonitorSettings::default(),
            notifier,
        );
        let err = monitor
            .upload(
                "c1",
                UploadFile {
                    file_name: "clip.mp4".to_string(),
                    mime_type: "video/mp4".to_string(),
                    bytes: vec![1, 2, 3],
                },
            )
            .await
            .expect_err("video is not accepted");
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(notices.recv().await.expect("notice").action, Action::Upload);
        assert!(monitor.view().can_upload("c1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_polls_pause_while_push_is_connected() {
        let server = httpmock::MockServer::start();
        let list = server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/api/admin/livechat/conversations");
            then.status(200)
                .json_body(serde_json::json!({ "conversations": [] }));
        });
        let monitor = ConversationMonitor::new(
            AdminClient::new(&server.base_url()).expect("client"),
            MonitorSettings {
                list_interval: std::time::Duration::from_millis(50),
                ..MonitorSettings::default()
            },
            Notifier::default(),
        );
        monitor.open();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(list.calls() >= 2);

        monitor.inner.on_connected();
        assert!(monitor.view().push_connected);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let settled = list.calls();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(list.calls(), settled);

        monitor.inner.on_disconnected();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(list.calls() > settled);
    }

    fn listed(id: &str, phase: ScreenSharePhase) -> Conversation {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "participant": { "name": "Visitor" },
            "status": "active",
            "assignedTo": "human",
            "messageCount": 1,
            "screenShareActive": phase.is_active(),
            "screenSharePhase": phase,
            "source": "dashboard",
            "createdAt": "2026-01-01T00:00:00+00:00",
            "updatedAt": "2026-01-01T00:00:05+00:00"
        }))
        .expect("conversation")
    }

    #[test]
    fn polled_phases_replace_local_screen_share_state() {
        let mut view = MonitorView::default();
        view.screen_shares.insert(
            "a".to_string(),
            ScreenShareSession::new(
                "a",
                ScreenSharePhase::PendingView,
                "2026-01-01T00:00:00+00:00".to_string(),
            ),
        );
        view.screen_shares.insert(
            "b".to_string(),
            ScreenShareSession::new(
                "b",
                ScreenSharePhase::Viewing,
                "2026-01-01T00:00:00+00:00".to_string(),
            ),
        );

        let polled = vec![
            listed("a", ScreenSharePhase::Viewing),
            listed("b", ScreenSharePhase::Inactive),
        ];
        assert!(reconcile_screen_shares(&mut view, &polled));
        assert_eq!(view.screen_share_phase("a"), ScreenSharePhase::Viewing);
        assert!(view.screen_shares["a"].active);
        assert!(!view.screen_shares.contains_key("b"));

        assert!(!reconcile_screen_shares(&mut view, &polled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detail_fetch_for_an_older_selection_is_dropped() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/api/admin/livechat/conversations/a/messages");
            then.status(200).json_body(serde_json::json!({
                "messages": [{
                    "id": "m1",
                    "conversationId": "a",
                    "sender": "user",
                    "content": "hi",
                    "createdAt": "2026-01-01T00:00:00+00:00"
                }]
            }));
        });
        let monitor = ConversationMonitor::new(
            AdminClient::new(&server.base_url()).expect("client"),
            MonitorSettings::default(),
            Notifier::default(),
        );
        // `a` re-selected: generation 2 is current, 1 is stale
        monitor
            .inner
            .view
            .send_modify(|view| view.selected = Some("a".to_string()));
        monitor.inner.detail_generation.store(2, Ordering::SeqCst);

        monitor.inner.refresh_messages("a", 1).await;
        assert!(monitor.view().messages.is_empty());

        monitor.inner.refresh_messages("a", 2).await;
        assert_eq!(monitor.view().messages.len(), 1);
    }
}
