//! Durable client-side queue of unconfirmed local mutations, plus the local
//! copies of notifications they refer to.
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::ClientStoreError;
use crate::models::{NewNotification, Notification, NotificationAction, NotificationPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Field edit waiting to reach the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
    pub patch: NotificationPatch,
    /// Values of the patched fields before the edit.
    pub previous: NotificationPatch,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Action { action: NotificationAction },
    Edit(PendingEdit),
}

/// What a queue item asks the server to do. `target` is always the local id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncPayload {
    Create { notification: NewNotification },
    Update { target: Uuid, change: Change },
    Delete { target: Uuid },
}

impl SyncPayload {
    pub fn operation(&self) -> SyncOperation {
        match self {
            Self::Create { .. } => SyncOperation::Create,
            Self::Update { .. } => SyncOperation::Update,
            Self::Delete { .. } => SyncOperation::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    /// Local id of the notification this item mutates.
    pub notification_id: Uuid,
    pub payload: SyncPayload,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    pub fn new(notification_id: Uuid, payload: SyncPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            payload,
            attempts: 0,
            created_at: OffsetDateTime::now_utc(),
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn operation(&self) -> SyncOperation {
        self.payload.operation()
    }

    /// Earliest time the item may be sent again. `None` means now.
    pub fn next_eligible_at(&self, config: &SyncConfig) -> Option<OffsetDateTime> {
        if self.attempts == 0 {
            return None;
        }
        let last = self.last_attempt_at?;
        Some(last + config.backoff_delay(self.attempts))
    }

    pub fn is_eligible(&self, now: OffsetDateTime, config: &SyncConfig) -> bool {
        self.next_eligible_at(config).map_or(true, |at| now >= at)
    }

    pub fn pending_edit(&self) -> Option<&PendingEdit> {
        match &self.payload {
            SyncPayload::Update {
                change: Change::Edit(edit),
                ..
            } => Some(edit),
            _ => None,
        }
    }

    pub fn pending_edit_mut(&mut self) -> Option<&mut PendingEdit> {
        match &mut self.payload {
            SyncPayload::Update {
                change: Change::Edit(edit),
                ..
            } => Some(edit),
            _ => None,
        }
    }
}

/// The device's copy of a notification. `record.id` is the local id until
/// the server assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalNotification {
    pub local_id: Uuid,
    pub server_id: Option<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub server_updated_at: Option<OffsetDateTime>,
    /// Deleted on this device only.
    pub deleted: bool,
    pub record: Notification,
}

#[derive(Clone)]
pub enum ClientStore {
    Memory(Arc<MemoryClientStore>),
    Sqlite(SqliteClientStore),
}

impl ClientStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryClientStore::default()))
    }

    pub async fn sqlite(url: &str) -> Result<Self, ClientStoreError> {
        Ok(Self::Sqlite(SqliteClientStore::connect(url).await?))
    }

    pub async fn save_local(&self, local: &LocalNotification) -> Result<(), ClientStoreError> {
        match self {
            Self::Memory(mem) => {
                mem.state
                    .lock()
                    .await
                    .locals
                    .insert(local.local_id, local.clone());
                Ok(())
            }
            Self::Sqlite(db) => db.save_local(local).await,
        }
    }

    pub async fn get_local(&self, local_id: Uuid) -> Result<Option<LocalNotification>, ClientStoreError> {
        match self {
            Self::Memory(mem) => Ok(mem.state.lock().await.locals.get(&local_id).cloned()),
            Self::Sqlite(db) => db.get_local(local_id).await,
        }
    }

    pub async fn find_by_server_id(
        &self,
        server_id: Uuid,
    ) -> Result<Option<LocalNotification>, ClientStoreError> {
        match self {
            Self::Memory(mem) => Ok(mem
                .state
                .lock()
                .await
                .locals
                .values()
                .find(|local| local.server_id == Some(server_id))
                .cloned()),
            Self::Sqlite(db) => db.find_by_server_id(server_id).await,
        }
    }

    pub async fn list_local(&self) -> Result<Vec<LocalNotification>, ClientStoreError> {
        match self {
            Self::Memory(mem) => {
                let mut locals: Vec<_> = mem.state.lock().await.locals.values().cloned().collect();
                locals.sort_by_key(|local| local.record.created_at);
                Ok(locals)
            }
            Self::Sqlite(db) => db.list_local().await,
        }
    }

    pub async fn enqueue(&self, item: &SyncQueueItem) -> Result<(), ClientStoreError> {
        match self {
            Self::Memory(mem) => {
                mem.state.lock().await.queue.push(item.clone());
                Ok(())
            }
            Self::Sqlite(db) => db.enqueue(item).await,
        }
    }

    /// Pending items, oldest first.
    pub async fn list_queue(&self) -> Result<Vec<SyncQueueItem>, ClientStoreError> {
        match self {
            Self::Memory(mem) => Ok(mem.state.lock().await.queue.clone()),
            Self::Sqlite(db) => db.list_queue().await,
        }
    }

    pub async fn update_item(&self, item: &SyncQueueItem) -> Result<(), ClientStoreError> {
        match self {
            Self::Memory(mem) => {
                let mut state = mem.state.lock().await;
                match state.queue.iter_mut().find(|queued| queued.id == item.id) {
                    Some(queued) => {
                        *queued = item.clone();
                        Ok(())
                    }
                    None => Err(ClientStoreError::NotFound(item.id)),
                }
            }
            Self::Sqlite(db) => db.update_item(item).await,
        }
    }

    pub async fn remove_item(&self, id: Uuid) -> Result<(), ClientStoreError> {
        match self {
            Self::Memory(mem) => {
                mem.state.lock().await.queue.retain(|item| item.id != id);
                Ok(())
            }
            Self::Sqlite(db) => db.remove_item(id).await,
        }
    }
}

#[derive(Default)]
struct MemoryClientState {
    locals: HashMap<Uuid, LocalNotification>,
    queue: Vec<SyncQueueItem>,
}

#[derive(Default)]
pub struct MemoryClientStore {
    state: Mutex<MemoryClientState>,
}

#[derive(FromRow)]
struct QueueRow {
    id: String,
    notification_id: String,
    payload: String,
    attempts: i64,
    created_at: String,
    last_attempt: Option<String>,
    error: Option<String>,
}

impl TryFrom<QueueRow> for SyncQueueItem {
    type Error = ClientStoreError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            notification_id: parse_uuid(&row.notification_id)?,
            payload: serde_json::from_str(&row.payload)?,
            attempts: u32::try_from(row.attempts)
                .map_err(|_| ClientStoreError::Corrupt(format!("attempts {}", row.attempts)))?,
            created_at: parse_ts(&row.created_at)?,
            last_attempt_at: row.last_attempt.as_deref().map(parse_ts).transpose()?,
            last_error: row.error,
        })
    }
}

#[derive(FromRow)]
struct LocalRow {
    record: String,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        notification_id TEXT NOT NULL,
        action TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        last_attempt TEXT,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS local_notifications (
        local_id TEXT PRIMARY KEY,
        server_id TEXT UNIQUE,
        created_at TEXT NOT NULL,
        record TEXT NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct SqliteClientStore {
    pool: Pool<Sqlite>,
}

impl SqliteClientStore {
    /// Opens (creating if needed) the database at `url`, e.g.
    /// `sqlite://sync.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, ClientStoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // An in-memory database exists per connection.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    async fn save_local(&self, local: &LocalNotification) -> Result<(), ClientStoreError> {
        sqlx::query(
            r#"
            INSERT INTO local_notifications (local_id, server_id, created_at, record)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (local_id) DO UPDATE
            SET server_id = excluded.server_id, record = excluded.record
            "#,
        )
        .bind(local.local_id.to_string())
        .bind(local.server_id.map(|id| id.to_string()))
        .bind(format_ts(local.record.created_at)?)
        .bind(serde_json::to_string(local)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_local(&self, local_id: Uuid) -> Result<Option<LocalNotification>, ClientStoreError> {
        let row = sqlx::query_as::<_, LocalRow>(
            "SELECT record FROM local_notifications WHERE local_id = ?1",
        )
        .bind(local_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| serde_json::from_str(&row.record).map_err(ClientStoreError::from))
            .transpose()
    }

    async fn find_by_server_id(
        &self,
        server_id: Uuid,
    ) -> Result<Option<LocalNotification>, ClientStoreError> {
        let row = sqlx::query_as::<_, LocalRow>(
            "SELECT record FROM local_notifications WHERE server_id = ?1",
        )
        .bind(server_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| serde_json::from_str(&row.record).map_err(ClientStoreError::from))
            .transpose()
    }

    async fn list_local(&self) -> Result<Vec<LocalNotification>, ClientStoreError> {
        let rows = sqlx::query_as::<_, LocalRow>(
            "SELECT record FROM local_notifications ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| serde_json::from_str(&row.record).map_err(ClientStoreError::from))
            .collect()
    }

    async fn enqueue(&self, item: &SyncQueueItem) -> Result<(), ClientStoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (id, notification_id, action, payload, attempts, created_at, last_attempt, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.notification_id.to_string())
        .bind(item.operation().as_str())
        .bind(serde_json::to_string(&item.payload)?)
        .bind(i64::from(item.attempts))
        .bind(format_ts(item.created_at)?)
        .bind(item.last_attempt_at.map(format_ts).transpose()?)
        .bind(item.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_queue(&self) -> Result<Vec<SyncQueueItem>, ClientStoreError> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, notification_id, payload, attempts, created_at, last_attempt, error
            FROM sync_queue
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncQueueItem::try_from).collect()
    }

    async fn update_item(&self, item: &SyncQueueItem) -> Result<(), ClientStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET payload = ?2, attempts = ?3, last_attempt = ?4, error = ?5
            WHERE id = ?1
            "#,
        )
        .bind(item.id.to_string())
        .bind(serde_json::to_string(&item.payload)?)
        .bind(i64::from(item.attempts))
        .bind(item.last_attempt_at.map(format_ts).transpose()?)
        .bind(item.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ClientStoreError::NotFound(item.id));
        }
        Ok(())
    }

    async fn remove_item(&self, id: Uuid) -> Result<(), ClientStoreError> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, ClientStoreError> {
    Uuid::parse_str(value).map_err(|_| ClientStoreError::Corrupt(format!("uuid {:?}", value)))
}

fn format_ts(ts: OffsetDateTime) -> Result<String, ClientStoreError> {
    ts.format(&Rfc3339)
        .map_err(|e| ClientStoreError::Corrupt(e.to_string()))
}

fn parse_ts(value: &str) -> Result<OffsetDateTime, ClientStoreError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|_| ClientStoreError::Corrupt(format!("timestamp {:?}", value)))
}
