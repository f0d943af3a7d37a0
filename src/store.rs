use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::PgRecordStore;
use crate::error::StoreError;
use crate::models::{ActionRecord, Device, Notification};

/// Durable notifications, devices and the action audit trail.
#[derive(Clone)]
pub enum RecordStore {
    Postgres(PgRecordStore),
    Memory(Arc<MemoryRecordStore>),
}

impl RecordStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(MemoryRecordStore::default()))
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pg) => pg.ping().await,
            Self::Memory(mem) => mem.check(),
        }
    }

    pub async fn insert_device(&self, device: &Device) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pg) => pg.insert_device(device).await,
            Self::Memory(mem) => mem.insert_device(device).await,
        }
    }

    pub async fn get_device(&self, id: Uuid) -> Result<Option<Device>, StoreError> {
        match self {
            Self::Postgres(pg) => pg.get_device(id).await,
            Self::Memory(mem) => mem.get_device(id).await,
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        match self {
            Self::Postgres(pg) => pg.list_devices().await,
            Self::Memory(mem) => mem.list_devices().await,
        }
    }

    /// Devices registered to `user_id`, oldest first.
    pub async fn list_user_devices(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        match self {
            Self::Postgres(pg) => pg.list_user_devices(user_id).await,
            Self::Memory(mem) => mem.list_user_devices(user_id).await,
        }
    }

    pub async fn touch_device(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pg) => pg.touch_device(id, at).await,
            Self::Memory(mem) => mem.touch_device(id, at).await,
        }
    }

    pub async fn delete_device(&self, id: Uuid) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(pg) => pg.delete_device(id).await,
            Self::Memory(mem) => mem.delete_device(id).await,
        }
    }

    /// Inserts a notification. A second insert with the same
    /// `(user_id, local_id)` returns the stored row instead.
    pub async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, StoreError> {
        match self {
            Self::Postgres(pg) => pg.insert_notification(notification).await,
            Self::Memory(mem) => mem.insert_notification(notification).await,
        }
    }

    pub async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        match self {
            Self::Postgres(pg) => pg.get_notification(id).await,
            Self::Memory(mem) => mem.get_notification(id).await,
        }
    }

    pub async fn save_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pg) => pg.save_notification(notification).await,
            Self::Memory(mem) => mem.save_notification(notification).await,
        }
    }

    pub async fn record_action(&self, record: &ActionRecord) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pg) => pg.record_action(record).await,
            Self::Memory(mem) => mem.record_action(record).await,
        }
    }

    pub async fn list_actions(&self, notification_id: Uuid) -> Result<Vec<ActionRecord>, StoreError> {
        match self {
            Self::Postgres(pg) => pg.list_actions(notification_id).await,
            Self::Memory(mem) => mem.list_actions(notification_id).await,
        }
    }

    /// Unexpired notifications of `user_id` modified after `since`, oldest
    /// change first.
    pub async fn changes_since(
        &self,
        user_id: Uuid,
        since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<Vec<Notification>, StoreError> {
        match self {
            Self::Postgres(pg) => pg.changes_since(user_id, since, now).await,
            Self::Memory(mem) => mem.changes_since(user_id, since, now).await,
        }
    }

    /// Hard-deletes expired notifications and their action records.
    /// Returns the deleted ids.
    pub async fn delete_expired(&self, now: OffsetDateTime) -> Result<Vec<Uuid>, StoreError> {
        match self {
            Self::Postgres(pg) => pg.delete_expired(now).await,
            Self::Memory(mem) => mem.delete_expired(now).await,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    devices: HashMap<Uuid, Device>,
    notifications: HashMap<Uuid, Notification>,
    by_local_id: HashMap<(Uuid, Uuid), Uuid>,
    actions: Vec<ActionRecord>,
}

/// Process-local backend used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryRecordStore {
    /// Makes every call fail with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    async fn insert_device(&self, device: &Device) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .devices
            .insert(device.id, device.clone());
        Ok(())
    }

    async fn get_device(&self, id: Uuid) -> Result<Option<Device>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.devices.get(&id).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.devices.values().cloned().collect())
    }

    async fn list_user_devices(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        self.check()?;
        let mut devices: Vec<Device> = self
            .state
            .read()
            .await
            .devices
            .values()
            .filter(|device| device.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by_key(|device| device.created_at);
        Ok(devices)
    }

    async fn touch_device(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        self.check()?;
        if let Some(device) = self.state.write().await.devices.get_mut(&id) {
            device.last_seen_at = Some(at);
        }
        Ok(())
    }

    async fn delete_device(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.state.write().await.devices.remove(&id).is_some())
    }

    async fn insert_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        if let Some(local_id) = notification.local_id {
            let key = (notification.user_id, local_id);
            if let Some(existing) = state
                .by_local_id
                .get(&key)
                .and_then(|id| state.notifications.get(id))
            {
                return Ok(existing.clone());
            }
            state.by_local_id.insert(key, notification.id);
        }
        state
            .notifications
            .insert(notification.id, notification.clone());
        Ok(notification.clone())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.notifications.get(&id).cloned())
    }

    async fn save_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.notifications.get_mut(&notification.id) {
            Some(stored) => {
                *stored = notification.clone();
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!(
                "notification {} vanished before update",
                notification.id
            ))),
        }
    }

    async fn record_action(&self, record: &ActionRecord) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.actions.push(record.clone());
        Ok(())
    }

    async fn list_actions(&self, notification_id: Uuid) -> Result<Vec<ActionRecord>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .actions
            .iter()
            .filter(|record| record.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn changes_since(
        &self,
        user_id: Uuid,
        since: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<Vec<Notification>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut changed: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && n.updated_at > since && !n.is_expired_at(now))
            .cloned()
            .collect();
        changed.sort_by_key(|n| n.updated_at);
        Ok(changed)
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<Vec<Uuid>, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let expired: Vec<Uuid> = state
            .notifications
            .values()
            .filter(|n| n.is_expired_at(now))
            .map(|n| n.id)
            .collect();
        for id in &expired {
            if let Some(n) = state.notifications.remove(id) {
                if let Some(local_id) = n.local_id {
                    state.by_local_id.remove(&(n.user_id, local_id));
                }
            }
        }
        state
            .actions
            .retain(|record| !expired.contains(&record.notification_id));
        Ok(expired)
    }
}
