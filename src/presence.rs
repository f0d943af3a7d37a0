use moka::future::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Device, DeviceConnection};

/// Tracks which devices of a user hold a live socket.
///
/// Live entries sit in a TTL cache that every heartbeat refreshes, so a
/// device that vanishes without closing its socket ages out on its own. A
/// device counts as online only while its last heartbeat is inside the
/// liveness window, which is shorter than the TTL.
#[derive(Clone)]
pub struct PresenceTracker {
    connections: Cache<Uuid, DeviceConnection>,
    members: Arc<RwLock<HashMap<Uuid, HashSet<Uuid>>>>,
    window: Duration,
}

impl PresenceTracker {
    pub fn new(window: Duration, ttl: Duration) -> Self {
        let connections = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(ttl.max(window))
            .build();

        Self {
            connections,
            members: Arc::new(RwLock::new(HashMap::new())),
            window,
        }
    }

    /// Loads device membership from registered devices.
    pub async fn seed<'a>(&self, devices: impl IntoIterator<Item = &'a Device>) {
        let mut members = self.members.write().await;
        let mut count = 0usize;
        for device in devices {
            members.entry(device.user_id).or_default().insert(device.id);
            count += 1;
        }
        info!(devices = count, "Seeded presence membership");
    }

    /// Adds a device to the user's set without marking it online.
    pub async fn register_device(&self, user_id: Uuid, device_id: Uuid) {
        self.members
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(device_id);
    }

    pub async fn add_device(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        connection_id: Uuid,
    ) -> DeviceConnection {
        self.register_device(user_id, device_id).await;
        let connection = DeviceConnection {
            device_id,
            user_id,
            connection_id,
            last_heartbeat: OffsetDateTime::now_utc(),
        };
        self.connections.insert(device_id, connection.clone()).await;
        debug!(user_id = %user_id, device_id = %device_id, "Device online");
        connection
    }

    /// Refreshes the live entry. Returns false if the device has none.
    pub async fn heartbeat(&self, device_id: Uuid) -> bool {
        match self.connections.get(&device_id) {
            Some(mut connection) => {
                connection.last_heartbeat = OffsetDateTime::now_utc();
                // Re-inserting restarts the entry's TTL.
                self.connections.insert(device_id, connection).await;
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, device_id: Uuid) -> bool {
        self.connections
            .get(&device_id)
            .is_some_and(|connection| self.is_live(&connection, OffsetDateTime::now_utc()))
    }

    pub async fn list_online_devices(&self, user_id: Uuid) -> Vec<Uuid> {
        let now = OffsetDateTime::now_utc();
        let members = self.members.read().await;
        members
            .get(&user_id)
            .map(|devices| {
                devices
                    .iter()
                    .copied()
                    .filter(|device_id| {
                        self.connections.get(device_id).is_some_and(|connection| {
                            connection.user_id == user_id && self.is_live(&connection, now)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn list_all_devices(&self, user_id: Uuid) -> Vec<Uuid> {
        self.members
            .read()
            .await
            .get(&user_id)
            .map(|devices| devices.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops the live entry. The device stays a member of its user's set.
    pub async fn remove_device(&self, device_id: Uuid) {
        self.connections.invalidate(&device_id).await;
        debug!(device_id = %device_id, "Device offline");
    }

    /// Drops the live entry only if it still belongs to `connection_id`, so
    /// a stale socket closing late cannot knock out its replacement.
    pub async fn remove_connection(&self, device_id: Uuid, connection_id: Uuid) -> bool {
        match self.connections.get(&device_id) {
            Some(connection) if connection.connection_id == connection_id => {
                self.remove_device(device_id).await;
                true
            }
            _ => false,
        }
    }

    /// Unregisters the device entirely.
    pub async fn forget_device(&self, user_id: Uuid, device_id: Uuid) {
        self.connections.invalidate(&device_id).await;
        let mut members = self.members.write().await;
        if let Some(devices) = members.get_mut(&user_id) {
            devices.remove(&device_id);
            if devices.is_empty() {
                members.remove(&user_id);
            }
        }
    }

    /// Evicts entries whose heartbeat fell outside the liveness window.
    /// Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let stale: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|(_, connection)| !self.is_live(connection, now))
            .map(|(device_id, _)| *device_id)
            .collect();
        for device_id in &stale {
            self.connections.invalidate(device_id).await;
        }
        stale.len()
    }

    fn is_live(&self, connection: &DeviceConnection, now: OffsetDateTime) -> bool {
        (now - connection.last_heartbeat).unsigned_abs() <= self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_online_and_offline_sets() {
        let presence = PresenceTracker::new(Duration::from_secs(60), Duration::from_secs(300));
        let user = Uuid::new_v4();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());

        presence.register_device(user, y).await;
        presence.add_device(user, x, Uuid::new_v4()).await;

        assert_eq!(presence.list_online_devices(user).await, vec![x]);
        let mut all = presence.list_all_devices(user).await;
        all.sort();
        let mut expected = vec![x, y];
        expected.sort();
        assert_eq!(all, expected);

        presence.remove_device(x).await;
        assert!(presence.list_online_devices(user).await.is_empty());
        assert_eq!(presence.list_all_devices(user).await.len(), 2);
    }

    #[tokio::test]
    async fn test_missed_heartbeats_demote_without_disconnect() {
        let presence = PresenceTracker::new(Duration::from_millis(50), Duration::from_secs(300));
        let user = Uuid::new_v4();
        let device = Uuid::new_v4();
        presence.add_device(user, device, Uuid::new_v4()).await;
        assert!(presence.is_online(device));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!presence.is_online(device));
        assert!(presence.list_online_devices(user).await.is_empty());

        assert!(presence.heartbeat(device).await);
        assert!(presence.is_online(device));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(presence.sweep().await, 1);
        assert!(!presence.heartbeat(device).await);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_remove_replacement() {
        let presence = PresenceTracker::new(Duration::from_secs(60), Duration::from_secs(300));
        let user = Uuid::new_v4();
        let device = Uuid::new_v4();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();

        presence.add_device(user, device, old).await;
        presence.add_device(user, device, new).await;

        assert!(!presence.remove_connection(device, old).await);
        assert!(presence.is_online(device));
        assert!(presence.remove_connection(device, new).await);
        assert!(!presence.is_online(device));
    }

    #[tokio::test]
    async fn test_device_connecting_during_fanout_still_gets_event() {
        use crate::bus::{Bus, Fanout};
        use crate::models::{NewNotification, SyncEvent};
        use crate::offline_queue::OfflineQueue;

        let presence = PresenceTracker::new(Duration::from_secs(60), Duration::from_secs(300));
        let offline = OfflineQueue::memory(100);
        let bus = Bus::local(16);
        let fanout = Fanout::new(bus.clone(), presence.clone(), offline.clone());
        let user = Uuid::new_v4();
        let (origin, target) = (Uuid::new_v4(), Uuid::new_v4());
        presence.register_device(user, origin).await;
        presence.register_device(user, target).await;

        let notification = NewNotification {
            local_id: None,
            app_name: "Bank".into(),
            title: "OTP Code".into(),
            body: "123456".into(),
            category: None,
            priority: None,
            created_at: None,
        }
        .into_notification(user, origin, OffsetDateTime::now_utc());
        let event = SyncEvent::new_notification(&notification, Some(origin));

        // Hold membership so the publish stalls inside its presence lookup.
        let members = presence.members.write().await;
        let publishing = tokio::spawn({
            let fanout = fanout.clone();
            let event = event.clone();
            async move { fanout.publish(&event).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Same order as a connecting socket: subscribe, then go online.
        let mut rx = bus.subscribe(user).await;
        presence
            .connections
            .insert(
                target,
                DeviceConnection {
                    device_id: target,
                    user_id: user,
                    connection_id: Uuid::new_v4(),
                    last_heartbeat: OffsetDateTime::now_utc(),
                },
            )
            .await;
        drop(members);

        publishing.await.unwrap().unwrap();
        let live = rx
            .try_recv()
            .ok()
            .and_then(|message| message.into_event())
            .is_some_and(|received| received.id == event.id);
        let queued = offline.len(target).await.unwrap();
        assert!(live || queued == 1, "event lost for connecting device");
    }

    #[tokio::test]
    async fn test_forget_device_removes_membership() {
        let presence = PresenceTracker::new(Duration::from_secs(60), Duration::from_secs(300));
        let user = Uuid::new_v4();
        let device = Uuid::new_v4();
        presence.add_device(user, device, Uuid::new_v4()).await;
        presence.forget_device(user, device).await;
        assert!(presence.list_all_devices(user).await.is_empty());
        assert!(!presence.is_online(device));
    }
}
