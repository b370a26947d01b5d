//! Transient user-facing notifications ("toasts").

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SendMessage,
    Escalate,
    ScreenShare,
    Upload,
    UpdatePermission,
    SaveConfig,
    TestCall,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Action::SendMessage => "send message",
            Action::Escalate => "escalate conversation",
            Action::ScreenShare => "update screen share",
            Action::Upload => "upload file",
            Action::UpdatePermission => "update permission",
            Action::SaveConfig => "save configuration",
            Action::TestCall => "place test call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub action: Action,
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn failure(action: Action, err: &ClientError) -> Self {
        Self {
            action,
            level: NoticeLevel::Error,
            message: format!("Failed to {}: {err}", action.label()),
        }
    }

    pub fn success(action: Action, message: impl Into<String>) -> Self {
        Self {
            action,
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }
}

/// Fan-out of notices to whoever is displaying them. Publishing with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl Notifier {
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }

    pub fn report(&self, action: Action, err: &ClientError) {
        tracing::warn!(action = action.label(), error = %err, "action failed");
        self.publish(Notice::failure(action, err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_notice_names_the_action() {
        let err = ClientError::Status {
            status: 500,
            message: "boom".to_string(),
        };
        let notice = Notice::failure(Action::SendMessage, &err);
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.message, "Failed to send message: server returned 500: boom");
    }

    #[tokio::test]
    async fn subscribers_receive_reported_failures() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();
        notifier.report(Action::Upload, &ClientError::Validation("empty file".to_string()));
        let notice = rx.recv().await.expect("notice");
        assert_eq!(notice.action, Action::Upload);
        assert_eq!(notice.message, "Failed to upload file: empty file");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        Notifier::default().publish(Notice::success(Action::SaveConfig, "Saved"));
    }
}
