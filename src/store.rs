//! Persistence for config documents, conversations and messages.
//!
//! The server talks to `Arc<dyn Store>`; `MemoryStore` backs tests and runs
//! without a database, `PgStore` keeps everything as JSONB in PostgreSQL.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{ChannelKind, Conversation, Message};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored record is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn document_key(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Livechat => "livechat_config",
        ChannelKind::Voip => "voip_config",
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_document(&self, kind: ChannelKind) -> Result<Option<Value>, StoreError>;
    async fn save_document(&self, kind: ChannelKind, body: &Value) -> Result<(), StoreError>;

    /// Most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;
    async fn append_message(&self, message: &Message) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<ChannelKind, Value>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_recent_first(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_document(&self, kind: ChannelKind) -> Result<Option<Value>, StoreError> {
        Ok(self.documents.read().await.get(&kind).cloned())
    }

    async fn save_document(&self, kind: ChannelKind, body: &Value) -> Result<(), StoreError> {
        self.documents.write().await.insert(kind, body.clone());
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations = self
            .conversations
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sort_recent_first(&mut conversations);
        Ok(conversations)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    /// Connects and brings the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        Ok(Self { db })
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(row: &sqlx::postgres::PgRow) -> Result<T, StoreError> {
    let body = row.try_get::<Json<Value>, _>("body")?;
    Ok(serde_json::from_value(body.0)?)
}

#[async_trait]
impl Store for PgStore {
    async fn load_document(&self, kind: ChannelKind) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT body FROM admin_documents WHERE key = $1")
            .bind(document_key(kind))
            .fetch_optional(&self.db)
            .await?;
        row.map(|row| row.try_get::<Json<Value>, _>("body").map(|body| body.0))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn save_document(&self, kind: ChannelKind, body: &Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO admin_documents (key, body, updated_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (key) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()",
        )
        .bind(document_key(kind))
        .bind(Json(body))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query("SELECT body FROM conversations ORDER BY updated_at DESC, id ASC")
            .fetch_all(&self.db)
            .await?;
        rows.into_iter()
            .map(|row| decode_body(&row))
            .collect()
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query("SELECT body FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(decode_body(&row)?))
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversations (id, body, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = EXCLUDED.updated_at",
        )
        .bind(&conversation.id)
        .bind(Json(serde_json::to_value(conversation)?))
        .bind(&conversation.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query("SELECT body FROM messages WHERE conversation_id = $1 ORDER BY seq ASC")
            .bind(conversation_id)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter()
            .map(|row| decode_body(&row))
            .collect()
    }

    async fn append_message(&self, message: &Message) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO messages (id, conversation_id, body) VALUES ($1, $2, $3)")
            .bind(&message.id)
            .bind(&message.conversation_id)
            .bind(Json(serde_json::to_value(message)?))
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
