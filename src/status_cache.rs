use moka::future::Cache;
use std::time::Duration;
use uuid::Uuid;

use crate::models::NotificationStatus;

/// Read-through snapshot of each notification's read/dismissed state.
#[derive(Clone)]
pub struct StatusCache {
    statuses: Cache<Uuid, NotificationStatus>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        let statuses = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(ttl)
            .build();
        Self { statuses }
    }

    pub fn get(&self, notification_id: Uuid) -> Option<NotificationStatus> {
        self.statuses.get(&notification_id)
    }

    /// Stores `status` unless a newer snapshot is already cached.
    pub async fn put(&self, status: NotificationStatus) {
        if let Some(existing) = self.statuses.get(&status.notification_id) {
            if existing.updated_at > status.updated_at {
                return;
            }
        }
        self.statuses.insert(status.notification_id, status).await;
    }

    pub async fn invalidate(&self, notification_id: Uuid) {
        self.statuses.invalidate(&notification_id).await;
    }

    pub async fn invalidate_many(&self, ids: &[Uuid]) {
        for id in ids {
            self.statuses.invalidate(id).await;
        }
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn test_older_snapshot_does_not_overwrite() {
        let cache = StatusCache::default();
        let id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        cache
            .put(NotificationStatus {
                notification_id: id,
                user_id,
                is_read: true,
                is_dismissed: true,
                updated_at: now,
            })
            .await;
        cache
            .put(NotificationStatus {
                notification_id: id,
                user_id,
                is_read: false,
                is_dismissed: false,
                updated_at: now - time::Duration::seconds(5),
            })
            .await;

        assert!(cache.get(id).unwrap().is_dismissed);
        cache.invalidate(id).await;
        assert!(cache.get(id).is_none());
    }
}
