use std::time::{Duration, Instant};

use httpmock::prelude::*;
use httpmock::Mock;
use livechat_console::client::{AdminClient, UploadFile};
use livechat_console::editor::{ConfigEditor, PermissionEditor};
use livechat_console::error::ClientError;
use livechat_console::monitor::{ConversationMonitor, MonitorView};
use livechat_console::notify::{Action, NoticeLevel, Notifier};
use livechat_console::permissions::Capability;
use livechat_console::screen_share::{ScreenShareAction, ScreenSharePhase};
use livechat_console::settings::MonitorSettings;
use livechat_console::types::{ChatProvider, LiveChatConfig, Surface};
use serde_json::{json, Value};

const CONVERSATIONS: &str = "/api/admin/livechat/conversations";
const LIVECHAT_CONFIG: &str = "/api/admin/livechat/config";

fn slow_polling() -> MonitorSettings {
    MonitorSettings {
        list_interval: Duration::from_secs(60),
        detail_interval: Duration::from_secs(60),
        ..MonitorSettings::default()
    }
}

fn conversation(id: &str, assigned_to: &str) -> Value {
    json!({
        "id": id,
        "participant": { "name": format!("Visitor {id}") },
        "status": "active",
        "assignedTo": assigned_to,
        "messageCount": 1,
        "source": "landing",
        "createdAt": "2026-03-01T10:00:00+00:00",
        "updatedAt": "2026-03-01T10:00:00+00:00"
    })
}

fn message(id: &str, conversation_id: &str, sender: &str, content: &str) -> Value {
    json!({
        "id": id,
        "conversationId": conversation_id,
        "sender": sender,
        "content": content,
        "createdAt": "2026-03-01T10:00:01+00:00"
    })
}

fn config_envelope(config: &LiveChatConfig) -> Value {
    json!({ "config": config })
}

fn monitor_for(server: &MockServer) -> (ConversationMonitor, Notifier) {
    let client = AdminClient::new(&server.base_url()).expect("client");
    let notifier = Notifier::default();
    (
        ConversationMonitor::new(client, slow_polling(), notifier.clone()),
        notifier,
    )
}

async fn wait_for_view(
    monitor: &ConversationMonitor,
    predicate: impl FnMut(&MonitorView) -> bool,
) -> MonitorView {
    let mut rx = monitor.subscribe();
    let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("view did not reach expected state")
        .expect("monitor dropped");
    view.clone()
}

async fn wait_for_calls(mock: &Mock<'_>, at_least: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while mock.calls() < at_least {
        assert!(
            Instant::now() < deadline,
            "expected at least {at_least} calls, saw {}",
            mock.calls()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn intercept_posts_once_and_refreshes_both_queries() {
    let server = MockServer::start();
    let list = server.mock(|when, then| {
        when.method(GET).path(CONVERSATIONS);
        then.status(200).json_body(json!({
            "conversations": [
                conversation("c1", "ai"),
                conversation("c2", "ai"),
                conversation("c3", "human"),
            ]
        }));
    });
    let messages = server.mock(|when, then| {
        when.method(GET).path(format!("{CONVERSATIONS}/c3/messages"));
        then.status(200).json_body(json!({
            "messages": [message("m1", "c3", "user", "I need help with my case")]
        }));
    });
    let intercept = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{CONVERSATIONS}/c3/intercept"))
            .json_body(json!({ "message": "Hello, this is Sarah from support" }));
        then.status(201).json_body(json!({
            "message": message("m2", "c3", "human", "Hello, this is Sarah from support")
        }));
    });

    let (monitor, _notifier) = monitor_for(&server);
    monitor.open();
    let view = wait_for_view(&monitor, |view| view.conversations.len() == 3).await;
    let assigned = view
        .conversations
        .iter()
        .map(|c| serde_json::to_value(c.assigned_to).expect("assignee"))
        .collect::<Vec<_>>();
    assert_eq!(assigned, vec![json!("ai"), json!("ai"), json!("human")]);

    monitor.select("c3");
    wait_for_view(&monitor, |view| view.messages.len() == 1).await;
    let list_before = list.calls();
    let messages_before = messages.calls();

    let sent = monitor
        .intercept("c3", "Hello, this is Sarah from support")
        .await
        .expect("intercept");
    assert_eq!(sent.id, "m2");

    intercept.assert_calls(1);
    wait_for_calls(&list, list_before + 1).await;
    wait_for_calls(&messages, messages_before + 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn switching_selection_discards_the_slower_response() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(CONVERSATIONS);
        then.status(200).json_body(json!({
            "conversations": [conversation("a", "ai"), conversation("b", "ai")]
        }));
    });
    let slow_a = server.mock(|when, then| {
        when.method(GET).path(format!("{CONVERSATIONS}/a/messages"));
        then.status(200)
            .delay(Duration::from_millis(400))
            .json_body(json!({ "messages": [message("ma", "a", "user", "from a")] }));
    });
    server.mock(|when, then| {
        when.method(GET).path(format!("{CONVERSATIONS}/b/messages"));
        then.status(200)
            .json_body(json!({ "messages": [message("mb", "b", "user", "from b")] }));
    });

    let (monitor, _notifier) = monitor_for(&server);
    monitor.open();
    monitor.select("a");
    wait_for_calls(&slow_a, 1).await;
    monitor.select("b");

    let view = wait_for_view(&monitor, |view| !view.messages.is_empty()).await;
    assert_eq!(view.selected.as_deref(), Some("b"));
    assert!(view.messages.iter().all(|m| m.conversation_id == "b"));

    // give the delayed response for `a` time to land
    tokio::time::sleep(Duration::from_millis(600)).await;
    let view = monitor.view();
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].id, "mb");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_one_upload_per_conversation_is_in_flight() {
    let server = MockServer::start();
    let upload_c1 = server.mock(|when, then| {
        when.method(POST).path(format!("{CONVERSATIONS}/c1/upload"));
        then.status(201)
            .delay(Duration::from_millis(300))
            .json_body(json!({
                "message": message("m1", "c1", "human", "brief.pdf"),
                "attachment": {
                    "id": "a1",
                    "fileName": "brief.pdf",
                    "mimeType": "application/pdf",
                    "sizeBytes": 4,
                    "kind": "document",
                    "url": "/api/media/a1.pdf"
                }
            }));
    });
    let upload_c2 = server.mock(|when, then| {
        when.method(POST).path(format!("{CONVERSATIONS}/c2/upload"));
        then.status(201).json_body(json!({
            "message": message("m2", "c2", "human", "photo.png"),
            "attachment": {
                "id": "a2",
                "fileName": "photo.png",
                "mimeType": "image/png",
                "sizeBytes": 4,
                "kind": "image",
                "url": "/api/media/a2.png"
            }
        }));
    });

    let (monitor, notifier) = monitor_for(&server);
    let mut notices = notifier.subscribe();
    let pdf = || UploadFile {
        file_name: "brief.pdf".to_string(),
        mime_type: "application/pdf".to_string(),
        bytes: b"%PDF".to_vec(),
    };
    let png = UploadFile {
        file_name: "photo.png".to_string(),
        mime_type: "image/png".to_string(),
        bytes: vec![0x89, b'P', b'N', b'G'],
    };

    let (first, second, other) = tokio::join!(
        monitor.upload("c1", pdf()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!monitor.view().can_upload("c1"));
            monitor.upload("c1", pdf()).await
        },
        monitor.upload("c2", png),
    );

    assert_eq!(first.expect("first upload").attachment.id, "a1");
    assert!(matches!(second, Err(ClientError::InFlight { .. })));
    assert_eq!(other.expect("other conversation").attachment.id, "a2");
    upload_c1.assert_calls(1);
    upload_c2.assert_calls(1);
    assert!(monitor.view().can_upload("c1"));

    let notice = notices.try_recv().expect("notice for refused upload");
    assert_eq!(notice.action, Action::Upload);
    assert_eq!(notice.level, NoticeLevel::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_actions_publish_a_notice_with_the_server_message() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(format!("{CONVERSATIONS}/c1/escalate"));
        then.status(409).json_body(json!({ "error": "conversation is closed" }));
    });

    let (monitor, notifier) = monitor_for(&server);
    let mut notices = notifier.subscribe();

    let err = monitor.escalate("c1").await.expect_err("closed");
    assert_eq!(err.status(), Some(409));
    assert!(monitor.view().can_escalate("c1"));

    let notice = notices.recv().await.expect("notice");
    assert_eq!(notice.action, Action::Escalate);
    assert_eq!(notice.level, NoticeLevel::Error);
    assert_eq!(
        notice.message,
        "Failed to escalate conversation: server returned 409: conversation is closed"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn screen_share_start_shows_pending_until_the_server_confirms() {
    let server = MockServer::start();
    let start = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{CONVERSATIONS}/c1/screen-share"))
            .json_body(json!({ "action": "start" }));
        then.status(200).json_body(json!({
            "session": {
                "conversationId": "c1",
                "phase": "pending_view",
                "active": false,
                "hasControl": false,
                "updatedAt": "2026-03-01T10:00:02+00:00"
            }
        }));
    });

    let (monitor, _notifier) = monitor_for(&server);
    let session = monitor
        .screen_share("c1", ScreenShareAction::Start)
        .await
        .expect("start");

    start.assert_calls(1);
    assert!(!session.active);
    assert_eq!(
        monitor.view().screen_share_phase("c1"),
        ScreenSharePhase::PendingView
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permission_toggle_sends_a_single_key_patch() {
    let server = MockServer::start();
    let mut stored = LiveChatConfig::default();
    server.mock(|when, then| {
        when.method(GET).path(LIVECHAT_CONFIG);
        then.status(200).json_body(config_envelope(&stored));
    });
    stored.dashboard_permissions.set(Capability::DataExport, true);
    let put = server.mock(|when, then| {
        when.method(PUT)
            .path(LIVECHAT_CONFIG)
            .json_body(json!({ "dashboardPermissions": { "dataExport": true } }));
        then.status(200).json_body(config_envelope(&stored));
    });

    let client = AdminClient::new(&server.base_url()).expect("client");
    let editor = PermissionEditor::new(client, Notifier::default());
    let loaded = editor.load().await.expect("load");
    assert!(!loaded.is_enabled(Surface::Dashboard, Capability::DataExport));

    editor
        .toggle(Surface::Dashboard, Capability::DataExport, true)
        .await
        .expect("toggle");
    editor
        .toggle(Surface::Dashboard, Capability::DataExport, true)
        .await
        .expect("same toggle again");

    put.assert_calls(2);
    let matrix = editor.matrix();
    assert!(matrix.is_enabled(Surface::Dashboard, Capability::DataExport));
    assert!(!matrix.is_enabled(Surface::Landing, Capability::DataExport));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_permission_toggle_rolls_back() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(LIVECHAT_CONFIG);
        then.status(200)
            .json_body(config_envelope(&LiveChatConfig::default()));
    });
    server.mock(|when, then| {
        when.method(PUT).path(LIVECHAT_CONFIG);
        then.status(500).json_body(json!({ "error": "storage failure" }));
    });

    let client = AdminClient::new(&server.base_url()).expect("client");
    let notifier = Notifier::default();
    let mut notices = notifier.subscribe();
    let editor = PermissionEditor::new(client, notifier);
    editor.load().await.expect("load");
    assert!(editor
        .matrix()
        .is_enabled(Surface::Landing, Capability::CaseIntake));

    let err = editor
        .toggle(Surface::Landing, Capability::CaseIntake, false)
        .await
        .expect_err("server error");
    assert_eq!(err.status(), Some(500));
    assert!(editor
        .matrix()
        .is_enabled(Surface::Landing, Capability::CaseIntake));

    let notice = notices.recv().await.expect("notice");
    assert_eq!(notice.action, Action::UpdatePermission);
    assert!(notice.message.contains("storage failure"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_switch_is_saved_without_stale_credentials() {
    let server = MockServer::start();
    let mut stored = LiveChatConfig::default();
    stored.channel.set_credential("appId", "app-123");
    stored.channel.set_credential("accessToken", "secret");
    server.mock(|when, then| {
        when.method(GET).path(LIVECHAT_CONFIG);
        then.status(200).json_body(config_envelope(&stored));
    });

    let mut switched = stored.clone();
    switched.channel.switch_provider(ChatProvider::Zendesk);
    let put = server.mock(|when, then| {
        when.method(PUT).path(LIVECHAT_CONFIG).json_body_includes(
            json!({
                "provider": {
                    "type": "zendesk",
                    "credentials": { "subdomain": "", "email": "", "apiToken": "" }
                }
            })
            .to_string(),
        );
        then.status(200).json_body(config_envelope(&switched));
    });

    let client = AdminClient::new(&server.base_url()).expect("client");
    let mut editor = ConfigEditor::<LiveChatConfig>::new(client, Notifier::default());
    editor.load().await.expect("load");
    editor.edit(|config| config.channel.switch_provider(ChatProvider::Zendesk));
    assert!(editor.is_dirty());

    let saved = editor.save().await.expect("save").clone();
    put.assert_calls(1);
    assert_eq!(saved.channel.provider.kind, ChatProvider::Zendesk);
    assert!(!saved.channel.provider.credentials.contains_key("appId"));
    assert!(!editor.is_dirty());
}
