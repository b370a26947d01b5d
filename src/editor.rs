//! Admin editors for channel configuration.
//!
//! Permission toggles are saved one at a time as they change. Everything
//! else is edited in a local draft and saved as one document.

use std::sync::Mutex;

use serde_json::Value;

use crate::channel::ConfigDocument;
use crate::client::AdminClient;
use crate::error::ClientError;
use crate::notify::{Action, Notice, Notifier};
use crate::patch::apply_patch;
use crate::permissions::{toggle_patch, Capability, PermissionMatrix};
use crate::types::{LiveChatConfig, Surface, TestCall, VoipConfig};

pub struct PermissionEditor {
    client: AdminClient,
    notifier: Notifier,
    matrix: Mutex<PermissionMatrix>,
}

fn matrix_of(config: &LiveChatConfig) -> PermissionMatrix {
    PermissionMatrix {
        dashboard: config.dashboard_permissions.clone(),
        landing: config.landing_permissions.clone(),
    }
}

impl PermissionEditor {
    pub fn new(client: AdminClient, notifier: Notifier) -> Self {
        Self {
            client,
            notifier,
            matrix: Mutex::new(PermissionMatrix::default()),
        }
    }

    fn with_matrix<T>(&self, f: impl FnOnce(&mut PermissionMatrix) -> T) -> T {
        match self.matrix.lock() {
            Ok(mut matrix) => f(&mut matrix),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn matrix(&self) -> PermissionMatrix {
        self.with_matrix(|matrix| matrix.clone())
    }

    pub async fn load(&self) -> Result<PermissionMatrix, ClientError> {
        let config = self.client.livechat_config().await?;
        let loaded = matrix_of(&config);
        self.with_matrix(|matrix| *matrix = loaded.clone());
        Ok(loaded)
    }

    /// Shows the new value immediately and saves it. On success the key is
    /// set to what the server stored; on failure it goes back to its old
    /// value unless another toggle has changed it since.
    pub async fn toggle(
        &self,
        surface: Surface,
        capability: Capability,
        enabled: bool,
    ) -> Result<(), ClientError> {
        let previous = self.with_matrix(|matrix| {
            let previous = matrix.is_enabled(surface, capability);
            matrix.set(surface, capability, enabled);
            previous
        });

        let patch = toggle_patch(surface, capability, enabled);
        match self.client.update_config::<LiveChatConfig>(&patch).await {
            Ok(config) => {
                let stored = matrix_of(&config).is_enabled(surface, capability);
                self.with_matrix(|matrix| {
                    if matrix.is_enabled(surface, capability) == enabled {
                        matrix.set(surface, capability, stored);
                    }
                });
                tracing::debug!(?surface, capability = %capability.key(), enabled = stored, "permission saved");
                Ok(())
            }
            Err(err) => {
                self.with_matrix(|matrix| {
                    if matrix.is_enabled(surface, capability) == enabled {
                        matrix.set(surface, capability, previous);
                    }
                });
                self.notifier.report(Action::UpdatePermission, &err);
                Err(err)
            }
        }
    }
}

/// Draft-and-save editor for one channel's configuration document.
pub struct ConfigEditor<D> {
    client: AdminClient,
    notifier: Notifier,
    saved: D,
    draft: D,
}

impl<D: ConfigDocument> ConfigEditor<D> {
    pub fn new(client: AdminClient, notifier: Notifier) -> Self {
        Self {
            client,
            notifier,
            saved: D::default(),
            draft: D::default(),
        }
    }

    pub async fn load(&mut self) -> Result<&D, ClientError> {
        let config = self.client.config::<D>().await?;
        self.saved = config.clone();
        self.draft = config;
        Ok(&self.draft)
    }

    pub fn draft(&self) -> &D {
        &self.draft
    }

    pub fn saved(&self) -> &D {
        &self.saved
    }

    pub fn is_dirty(&self) -> bool {
        self.draft != self.saved
    }

    /// Typed edit of the draft.
    pub fn edit(&mut self, f: impl FnOnce(&mut D)) {
        f(&mut self.draft);
    }

    /// Sets the value at `path` in the draft. The draft is unchanged if the
    /// result does not decode as a valid document.
    pub fn apply_patch(&mut self, path: &[&str], value: Value) -> Result<(), ClientError> {
        let doc = serde_json::to_value(&self.draft)
            .map_err(|err| ClientError::Validation(err.to_string()))?;
        let next = apply_patch(&doc, path, value)?;
        self.draft = serde_json::from_value(next).map_err(|err| {
            ClientError::Validation(format!("invalid value at {}: {err}", path.join(".")))
        })?;
        Ok(())
    }

    pub fn discard(&mut self) {
        self.draft = self.saved.clone();
    }

    /// Saves the draft, minus fields another editor owns. On failure the
    /// draft is kept so the edit can be retried.
    pub async fn save(&mut self) -> Result<&D, ClientError> {
        let body = self
            .draft
            .save_body()
            .map_err(|err| ClientError::Validation(err.to_string()))?;
        match self.client.update_config::<D>(&body).await {
            Ok(config) => {
                tracing::info!(channel = ?D::KIND, "configuration saved");
                self.saved = config.clone();
                self.draft = config;
                self.notifier
                    .publish(Notice::success(Action::SaveConfig, "Configuration saved"));
                Ok(&self.draft)
            }
            Err(err) => {
                self.notifier.report(Action::SaveConfig, &err);
                Err(err)
            }
        }
    }
}

impl ConfigEditor<VoipConfig> {
    /// Places a test call with the saved provider settings.
    pub async fn test_call(&self, to: &str) -> Result<TestCall, ClientError> {
        match self.client.test_call(to).await {
            Ok(call) => {
                self.notifier.publish(Notice::success(
                    Action::TestCall,
                    format!("Test call to {} {}", call.to, call.status),
                ));
                Ok(call)
            }
            Err(err) => {
                self.notifier.report(Action::TestCall, &err);
                Err(err)
            }
        }
    }
}
