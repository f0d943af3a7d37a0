use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::db::PgOfflineQueue;
use crate::error::StoreError;
use crate::metrics;
use crate::models::{QueuedMessage, SyncEvent};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const QUEUE_RETENTION: time::Duration = time::Duration::days(7);

/// Durable per-device backlog of events published while the device was
/// offline. Drained oldest first when the device reconnects.
#[derive(Clone)]
pub enum OfflineQueue {
    Memory(Arc<MemoryOfflineQueue>),
    Postgres(PgOfflineQueue),
}

impl OfflineQueue {
    pub fn memory(capacity: usize) -> Self {
        Self::Memory(Arc::new(MemoryOfflineQueue::new(capacity)))
    }

    pub async fn enqueue(&self, device_id: Uuid, event: &SyncEvent) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let message = QueuedMessage {
            id: Uuid::new_v4(),
            device_id,
            event: event.clone(),
            enqueued_at: now,
            expires_at: (now + QUEUE_RETENTION).min(event.notification.expires_at),
        };
        match self {
            Self::Memory(mem) => mem.push(message).await,
            Self::Postgres(pg) => pg.push(&message).await?,
        }
        metrics::OFFLINE_ENQUEUED.inc();
        debug!(device_id = %device_id, event_id = %event.id, "Queued event for offline device");
        Ok(())
    }

    /// Removes and returns every unexpired message for the device.
    pub async fn drain(&self, device_id: Uuid) -> Result<Vec<QueuedMessage>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let messages = match self {
            Self::Memory(mem) => mem.drain(device_id, now).await,
            Self::Postgres(pg) => pg.drain(device_id, now).await?,
        };
        metrics::OFFLINE_DRAINED.inc_by(messages.len() as u64);
        Ok(messages)
    }

    /// Puts undelivered messages back in front of anything queued since.
    pub async fn restore(&self, messages: Vec<QueuedMessage>) -> Result<(), StoreError> {
        match self {
            Self::Memory(mem) => mem.restore(messages).await,
            Self::Postgres(pg) => {
                for message in &messages {
                    pg.push(message).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn len(&self, device_id: Uuid) -> Result<usize, StoreError> {
        match self {
            Self::Memory(mem) => Ok(mem.len(device_id).await),
            Self::Postgres(pg) => pg.len(device_id).await,
        }
    }

    /// Drops queued events that refer to deleted notifications.
    pub async fn purge_notifications(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        match self {
            Self::Memory(mem) => Ok(mem.purge(|m| ids.contains(&m.event.notification.id)).await),
            Self::Postgres(pg) => pg.purge_notifications(ids).await,
        }
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        match self {
            Self::Memory(mem) => Ok(mem.purge(|m| m.expires_at <= now).await),
            Self::Postgres(pg) => pg.purge_expired(now).await,
        }
    }
}

pub struct MemoryOfflineQueue {
    capacity: usize,
    queues: Mutex<HashMap<Uuid, VecDeque<QueuedMessage>>>,
}

impl MemoryOfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    async fn push(&self, message: QueuedMessage) {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(message.device_id).or_default();
        queue.push_back(message);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    async fn drain(&self, device_id: Uuid, now: OffsetDateTime) -> Vec<QueuedMessage> {
        let mut queues = self.queues.lock().await;
        queues
            .remove(&device_id)
            .map(|queue| queue.into_iter().filter(|m| m.expires_at > now).collect())
            .unwrap_or_default()
    }

    async fn restore(&self, messages: Vec<QueuedMessage>) {
        let mut queues = self.queues.lock().await;
        for message in messages.into_iter().rev() {
            let queue = queues.entry(message.device_id).or_default();
            queue.push_front(message);
            while queue.len() > self.capacity {
                queue.pop_front();
            }
        }
    }

    async fn len(&self, device_id: Uuid) -> usize {
        self.queues
            .lock()
            .await
            .get(&device_id)
            .map_or(0, VecDeque::len)
    }

    async fn purge(&self, mut doomed: impl FnMut(&QueuedMessage) -> bool) -> u64 {
        let mut queues = self.queues.lock().await;
        let mut removed = 0;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|m| !doomed(m));
            removed += (before - queue.len()) as u64;
        }
        queues.retain(|_, queue| !queue.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewNotification, Notification, NotificationAction};

    fn notification() -> Notification {
        NewNotification {
            local_id: None,
            app_name: "Mail".into(),
            title: "hello".into(),
            body: String::new(),
            category: None,
            priority: None,
            created_at: None,
        }
        .into_notification(Uuid::new_v4(), Uuid::new_v4(), OffsetDateTime::now_utc())
    }

    #[tokio::test]
    async fn test_drain_is_fifo_and_empties() {
        let queue = OfflineQueue::memory(DEFAULT_QUEUE_CAPACITY);
        let device = Uuid::new_v4();
        let n = notification();
        let first = SyncEvent::new_notification(&n, None);
        let second = SyncEvent::status_sync(&n, None, Some(NotificationAction::Dismissed));

        queue.enqueue(device, &first).await.unwrap();
        queue.enqueue(device, &second).await.unwrap();

        let drained = queue.drain(device).await.unwrap();
        let ids: Vec<Uuid> = drained.iter().map(|m| m.event.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(queue.drain(device).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let queue = OfflineQueue::memory(3);
        let device = Uuid::new_v4();
        let n = notification();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let event = SyncEvent::status_sync(&n, None, None);
            ids.push(event.id);
            queue.enqueue(device, &event).await.unwrap();
        }

        assert_eq!(queue.len(device).await.unwrap(), 3);
        let drained: Vec<Uuid> = queue
            .drain(device)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.event.id)
            .collect();
        assert_eq!(drained, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn test_restore_goes_in_front() {
        let queue = OfflineQueue::memory(DEFAULT_QUEUE_CAPACITY);
        let device = Uuid::new_v4();
        let n = notification();
        let old = SyncEvent::new_notification(&n, None);
        queue.enqueue(device, &old).await.unwrap();
        let undelivered = queue.drain(device).await.unwrap();

        let newer = SyncEvent::status_sync(&n, None, None);
        queue.enqueue(device, &newer).await.unwrap();
        queue.restore(undelivered).await.unwrap();

        let order: Vec<Uuid> = queue
            .drain(device)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.event.id)
            .collect();
        assert_eq!(order, vec![old.id, newer.id]);
    }

    #[tokio::test]
    async fn test_purge_by_notification() {
        let queue = OfflineQueue::memory(DEFAULT_QUEUE_CAPACITY);
        let device = Uuid::new_v4();
        let keep = notification();
        let gone = notification();
        queue.enqueue(device, &SyncEvent::new_notification(&keep, None)).await.unwrap();
        queue.enqueue(device, &SyncEvent::new_notification(&gone, None)).await.unwrap();

        assert_eq!(queue.purge_notifications(&[gone.id]).await.unwrap(), 1);
        let left = queue.drain(device).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event.notification.id, keep.id);
    }
}
