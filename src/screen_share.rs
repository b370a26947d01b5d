//! Per-conversation screen-share session.
//!
//! Operator requests only move a session into a pending phase; viewing and
//! control are granted by the remote party and reported back through the
//! provider webhook.
//!
//! ```text
//! inactive --start--> pending_view --view_granted--> viewing
//! viewing --request_control--> pending_control --control_granted--> controlling
//! pending_view --view_declined--> inactive
//! pending_control --control_declined--> viewing
//! any --stop | ended--> inactive
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ScreenShareFlags;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenSharePhase {
    #[default]
    Inactive,
    PendingView,
    Viewing,
    PendingControl,
    Controlling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenShareAction {
    Start,
    Stop,
    RequestControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteScreenShareEvent {
    ViewGranted,
    ViewDeclined,
    ControlGranted,
    ControlDeclined,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenShareInput {
    Action(ScreenShareAction),
    Remote(RemoteScreenShareEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {input:?} while screen share is {from:?}")]
pub struct InvalidTransition {
    pub from: ScreenSharePhase,
    pub input: ScreenShareInput,
}

impl ScreenSharePhase {
    pub fn apply(self, input: ScreenShareInput) -> Result<Self, InvalidTransition> {
        use RemoteScreenShareEvent as Remote;
        use ScreenShareAction as Action;
        use ScreenSharePhase::*;

        let next = match (self, input) {
            (_, ScreenShareInput::Action(Action::Stop)) => Some(Inactive),
            (_, ScreenShareInput::Remote(Remote::Ended)) => Some(Inactive),
            (Inactive, ScreenShareInput::Action(Action::Start)) => Some(PendingView),
            (PendingView, ScreenShareInput::Remote(Remote::ViewGranted)) => Some(Viewing),
            (PendingView, ScreenShareInput::Remote(Remote::ViewDeclined)) => Some(Inactive),
            (Viewing, ScreenShareInput::Action(Action::RequestControl)) => Some(PendingControl),
            (PendingControl, ScreenShareInput::Remote(Remote::ControlGranted)) => {
                Some(Controlling)
            }
            (PendingControl, ScreenShareInput::Remote(Remote::ControlDeclined)) => Some(Viewing),
            _ => None,
        };
        next.ok_or(InvalidTransition { from: self, input })
    }

    /// The operator can see the remote screen.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ScreenSharePhase::Viewing
                | ScreenSharePhase::PendingControl
                | ScreenSharePhase::Controlling
        )
    }

    pub fn has_control(self) -> bool {
        self == ScreenSharePhase::Controlling
    }

    pub fn flags(self) -> ScreenShareFlags {
        ScreenShareFlags {
            active: self.is_active(),
            has_control: self.has_control(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareSession {
    pub conversation_id: String,
    pub phase: ScreenSharePhase,
    pub active: bool,
    pub has_control: bool,
    pub updated_at: String,
}

impl ScreenShareSession {
    pub fn new(conversation_id: &str, phase: ScreenSharePhase, updated_at: String) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            phase,
            active: phase.is_active(),
            has_control: phase.has_control(),
            updated_at,
        }
    }
}

/// Live sessions keyed by conversation id. A session exists from `start`
/// until it returns to `inactive`.
#[derive(Debug, Default)]
pub struct ScreenShareRegistry {
    sessions: HashMap<String, ScreenSharePhase>,
}

impl ScreenShareRegistry {
    pub fn phase(&self, conversation_id: &str) -> ScreenSharePhase {
        self.sessions
            .get(conversation_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn apply(
        &mut self,
        conversation_id: &str,
        input: ScreenShareInput,
    ) -> Result<ScreenSharePhase, InvalidTransition> {
        let next = self.phase(conversation_id).apply(input)?;
        if next == ScreenSharePhase::Inactive {
            self.sessions.remove(conversation_id);
        } else {
            self.sessions.insert(conversation_id.to_string(), next);
        }
        Ok(next)
    }

    pub fn end(&mut self, conversation_id: &str) -> bool {
        self.sessions.remove(conversation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
