use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, Pool, Postgres};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ActionRecord, Device, Notification, QueuedMessage, SyncEvent};

pub async fn init_db_pool(database_url: &str) -> Result<Pool<Postgres>> {
    info!("Initializing database connection pool");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[derive(FromRow)]
struct DeviceRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    platform: String,
    token_hash: String,
    created_at: OffsetDateTime,
    last_seen_at: Option<OffsetDateTime>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            platform: row.platform,
            token_hash: row.token_hash,
            created_at: row.created_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

#[derive(FromRow)]
struct NotificationRow {
    id: Uuid,
    local_id: Option<Uuid>,
    user_id: Uuid,
    source_device_id: Uuid,
    app_name: String,
    title: String,
    body: String,
    category: String,
    priority: i16,
    is_read: bool,
    is_dismissed: bool,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let category = row
            .category
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("category {:?} on {}", row.category, row.id)))?;
        Ok(Self {
            id: row.id,
            local_id: row.local_id,
            user_id: row.user_id,
            source_device_id: row.source_device_id,
            app_name: row.app_name,
            title: row.title,
            body: row.body,
            category,
            priority: row.priority,
            is_read: row.is_read,
            is_dismissed: row.is_dismissed,
            created_at: row.created_at,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ActionRow {
    id: Uuid,
    notification_id: Uuid,
    device_id: Uuid,
    action_type: String,
    timestamp: OffsetDateTime,
}

impl TryFrom<ActionRow> for ActionRecord {
    type Error = StoreError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        let action_type = row
            .action_type
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("action {:?} on {}", row.action_type, row.id)))?;
        Ok(Self {
            id: row.id,
            notification_id: row.notification_id,
            device_id: row.device_id,
            action_type,
            timestamp: row.timestamp,
        })
    }
}

const NOTIFICATION_COLUMNS: &str = "id, local_id, user_id, source_device_id, app_name, title, \
     body, category, priority, is_read, is_dismissed, created_at, expires_at, updated_at";

#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_device(&self, device: &Device) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devices (id, user_id, name, platform, token_hash, created_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(device.id)
        .bind(device.user_id)
        .bind(&device.name)
        .bind(&device.platform)
        .bind(&device.token_hash)
        .bind(device.created_at)
        .bind(device.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_device(&self, id: Uuid) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, user_id, name, platform, token_hash, created_at, last_seen_at
            FROM devices
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Device::from))
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, user_id, name, platform, token_hash, created_at, last_seen_at FROM devices",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    pub async fn list_user_devices(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, user_id, name, platform, token_hash, created_at, last_seen_at
            FROM devices
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    pub async fn touch_device(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        sqlx::query("UPDATE devices SET last_seen_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_device(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM offline_messages WHERE device_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_notification(
        &self,
        n: &Notification,
    ) -> Result<Notification, StoreError> {
        let inserted = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            INSERT INTO notifications ({NOTIFICATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (user_id, local_id) WHERE local_id IS NOT NULL DO NOTHING
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(n.id)
        .bind(n.local_id)
        .bind(n.user_id)
        .bind(n.source_device_id)
        .bind(&n.app_name)
        .bind(&n.title)
        .bind(&n.body)
        .bind(n.category.as_str())
        .bind(n.priority)
        .bind(n.is_read)
        .bind(n.is_dismissed)
        .bind(n.created_at)
        .bind(n.expires_at)
        .bind(n.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return row.try_into();
        }

        // Lost the race to an earlier insert with the same local id.
        debug!(user_id = %n.user_id, local_id = ?n.local_id, "Notification already stored");
        let existing = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user_id = $1 AND local_id = $2"
        ))
        .bind(n.user_id)
        .bind(n.local_id)
        .fetch_one(&self.pool)
        .await?;
        existing.try_into()
    }

    pub async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Notification::try_from).transpose()
    }

    pub async fn save_notification(&self, n: &Notification) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET title = $2, body = $3, category = $4, priority = $5,
                is_read = $6, is_dismissed = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(n.id)
        .bind(&n.title)
        .bind(&n.body)
        .bind(n.category.as_str())
        .bind(n.priority)
        .bind(n.is_read)
        .bind(n.is_dismissed)
        .bind(n.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!(
                "notification {} vanished before update",
                n.id
            )));
        }
        Ok(())
    }

    pub async fn record_action(&self, record: &ActionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_actions (id, notification_id, device_id, action_type, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(record.notification_id)
        .bind(record.device_id)
        .bind(record.action_type.as_str())
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_actions(&self, notification_id: Uuid) -> Result<Vec<ActionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ActionRow>(
            r#"
            SELECT id, notification_id, device_id, action_type, timestamp
            FROM notification_actions
            WHERE notification_id = $1
            ORDER BY timestamp
            "#,
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ActionRecord::try_from).collect()
    }

    pub async fn changes_since(
        &self,
        user_id: Uuid,
        since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE user_id = $1 AND updated_at > $2 AND expires_at > $3
            ORDER BY updated_at
            "#
        ))
        .bind(user_id)
        .bind(since)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    pub async fn delete_expired(&self, now: OffsetDateTime) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("DELETE FROM notifications WHERE expires_at <= $1 RETURNING id")
                .bind(now)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}

#[derive(FromRow)]
struct QueuedRow {
    id: Uuid,
    device_id: Uuid,
    payload: Json<SyncEvent>,
    enqueued_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

impl From<QueuedRow> for QueuedMessage {
    fn from(row: QueuedRow) -> Self {
        Self {
            id: row.id,
            device_id: row.device_id,
            event: row.payload.0,
            enqueued_at: row.enqueued_at,
            expires_at: row.expires_at,
        }
    }
}

/// Per-device FIFO kept in `offline_messages`.
#[derive(Clone)]
pub struct PgOfflineQueue {
    pool: Pool<Postgres>,
    capacity: i64,
}

impl PgOfflineQueue {
    pub fn new(pool: Pool<Postgres>, capacity: usize) -> Self {
        Self {
            pool,
            capacity: capacity as i64,
        }
    }

    pub async fn push(&self, message: &QueuedMessage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO offline_messages (id, device_id, notification_id, payload, enqueued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.device_id)
        .bind(message.event.notification.id)
        .bind(Json(&message.event))
        .bind(message.enqueued_at)
        .bind(message.expires_at)
        .execute(&mut *tx)
        .await?;

        // Oldest entries beyond the cap are dropped.
        sqlx::query(
            r#"
            DELETE FROM offline_messages
            WHERE seq IN (
                SELECT seq FROM offline_messages
                WHERE device_id = $1
                ORDER BY enqueued_at DESC, seq DESC
                OFFSET $2
            )
            "#,
        )
        .bind(message.device_id)
        .bind(self.capacity)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn drain(&self, device_id: Uuid, now: OffsetDateTime) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, QueuedRow>(
            r#"
            SELECT id, device_id, payload, enqueued_at, expires_at
            FROM offline_messages
            WHERE device_id = $1 AND expires_at > $2
            ORDER BY enqueued_at, seq
            FOR UPDATE
            "#,
        )
        .bind(device_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM offline_messages WHERE device_id = $1")
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(QueuedMessage::from).collect())
    }

    pub async fn len(&self, device_id: Uuid) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM offline_messages WHERE device_id = $1")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    pub async fn purge_notifications(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM offline_messages WHERE notification_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM offline_messages WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
