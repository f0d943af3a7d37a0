use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::{Pool, Postgres};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::PgRecordStore;
use crate::error::StoreError;
use crate::metrics;
use crate::models::{BusMessage, DeviceStatus, NotificationAction, SyncEvent, SyncEventKind};
use crate::offline_queue::OfflineQueue;
use crate::presence::PresenceTracker;

const PG_CHANNEL: &str = "notisync_events";

/// Per-user broadcast channels local to this process.
#[derive(Clone)]
pub struct Subscribers {
    channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<BusMessage>>>>,
    capacity: usize,
}

impl Subscribers {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<BusMessage> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Hands the message to every local subscriber of its user. Returns the
    /// number of receivers reached.
    pub async fn dispatch(&self, message: BusMessage) -> usize {
        let channels = self.channels.lock().await;
        match channels.get(&message.user_id()) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Forgets the user's channel once nobody listens on it.
    pub async fn prune(&self, user_id: Uuid) {
        let mut channels = self.channels.lock().await;
        if channels
            .get(&user_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&user_id);
        }
    }

    pub async fn subscriber_count(&self, user_id: Uuid) -> usize {
        self.channels
            .lock()
            .await
            .get(&user_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// Single-instance bus.
#[derive(Clone)]
pub struct LocalBus {
    subscribers: Subscribers,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Subscribers::new(capacity),
        }
    }
}

/// A sync event as it travels over LISTEN/NOTIFY. The notification snapshot
/// is reloaded on the receiving side to stay under the NOTIFY payload limit.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    kind: SyncEventKind,
    user_id: Uuid,
    origin_device_id: Option<Uuid>,
    action: Option<NotificationAction>,
    notification_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
enum Notice {
    Event(Envelope),
    DeviceStatus(DeviceStatus),
}

/// Multi-instance bus over Postgres LISTEN/NOTIFY. Every instance listens on
/// one channel and routes by user id to its local subscribers.
#[derive(Clone)]
pub struct PgBus {
    pool: Pool<Postgres>,
    store: PgRecordStore,
    subscribers: Subscribers,
}

impl PgBus {
    pub fn new(pool: Pool<Postgres>, capacity: usize) -> Self {
        Self {
            store: PgRecordStore::new(pool.clone()),
            pool,
            subscribers: Subscribers::new(capacity),
        }
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), StoreError> {
        let notice = match message {
            BusMessage::Event(event) => Notice::Event(Envelope {
                id: event.id,
                kind: event.kind,
                user_id: event.user_id,
                origin_device_id: event.origin_device_id,
                action: event.action,
                notification_id: event.notification.id,
                timestamp: event.timestamp,
            }),
            BusMessage::DeviceStatus(status) => Notice::DeviceStatus(status.clone()),
        };
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(PG_CHANNEL)
            .bind(serde_json::to_string(&notice)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forwards notifications from Postgres to local subscribers until
    /// shutdown, reconnecting with exponential backoff.
    pub async fn run_listener(self, mut shutdown: watch::Receiver<bool>) {
        let mut reconnect_delay = 1u64;

        'outer: loop {
            let listener = match self.listen().await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to listen on {}: {}", PG_CHANNEL, e);
                    let delay = Duration::from_secs(reconnect_delay);
                    reconnect_delay = std::cmp::min(reconnect_delay * 2, 60);
                    info!("Retrying bus listener in {} seconds", delay.as_secs());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue 'outer,
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            };
            let mut listener = listener;
            reconnect_delay = 1;
            info!("Bus listener attached to {}", PG_CHANNEL);

            loop {
                tokio::select! {
                    received = listener.recv() => match received {
                        Ok(notification) => self.forward(notification.payload()).await,
                        Err(e) => {
                            warn!("Bus listener interrupted: {}", e);
                            continue 'outer;
                        }
                    },
                    _ = shutdown.changed() => break 'outer,
                }
            }
        }

        info!("Bus listener stopped");
    }

    async fn listen(&self) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(PG_CHANNEL).await?;
        Ok(listener)
    }

    async fn forward(&self, payload: &str) {
        let envelope = match serde_json::from_str(payload) {
            Ok(Notice::Event(envelope)) => envelope,
            Ok(Notice::DeviceStatus(status)) => {
                self.subscribers.dispatch(BusMessage::DeviceStatus(status)).await;
                return;
            }
            Err(e) => {
                warn!("Dropping malformed bus payload: {}", e);
                return;
            }
        };
        // No local subscriber for this user, nothing to load.
        if self.subscribers.subscriber_count(envelope.user_id).await == 0 {
            return;
        }
        let notification = match self.store.get_notification(envelope.notification_id).await {
            Ok(Some(notification)) => notification,
            Ok(None) => {
                debug!(notification_id = %envelope.notification_id, "Bus event for deleted notification");
                return;
            }
            Err(e) => {
                error!("Failed to load notification for bus event: {}", e);
                return;
            }
        };
        self.subscribers
            .dispatch(BusMessage::Event(SyncEvent {
                id: envelope.id,
                kind: envelope.kind,
                user_id: envelope.user_id,
                origin_device_id: envelope.origin_device_id,
                action: envelope.action,
                notification,
                timestamp: envelope.timestamp,
            }))
            .await;
    }
}

/// Channel-per-user publish/subscribe.
#[derive(Clone)]
pub enum Bus {
    Local(LocalBus),
    Postgres(PgBus),
}

impl Bus {
    pub fn local(capacity: usize) -> Self {
        Self::Local(LocalBus::new(capacity))
    }

    fn subscribers(&self) -> &Subscribers {
        match self {
            Self::Local(bus) => &bus.subscribers,
            Self::Postgres(bus) => &bus.subscribers,
        }
    }

    pub async fn publish(&self, event: &SyncEvent) -> Result<(), StoreError> {
        self.send(BusMessage::Event(event.clone())).await?;
        metrics::EVENTS_PUBLISHED.inc();
        Ok(())
    }

    /// Live only; a device that misses a status change learns the current
    /// state on its next connect.
    pub async fn publish_device_status(&self, status: DeviceStatus) -> Result<(), StoreError> {
        self.send(BusMessage::DeviceStatus(status)).await
    }

    async fn send(&self, message: BusMessage) -> Result<(), StoreError> {
        match self {
            Self::Local(bus) => {
                bus.subscribers.dispatch(message).await;
            }
            Self::Postgres(bus) => bus.publish(&message).await?,
        }
        Ok(())
    }

    pub async fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<BusMessage> {
        self.subscribers().subscribe(user_id).await
    }

    pub async fn prune(&self, user_id: Uuid) {
        self.subscribers().prune(user_id).await
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub queued_for: Vec<Uuid>,
}

/// Publishes an event to live subscribers and queues it for every other
/// device of the user that is not online.
#[derive(Clone)]
pub struct Fanout {
    bus: Bus,
    presence: PresenceTracker,
    offline: OfflineQueue,
}

impl Fanout {
    pub fn new(bus: Bus, presence: PresenceTracker, offline: OfflineQueue) -> Self {
        Self {
            bus,
            presence,
            offline,
        }
    }

    /// Presence is read before anything is sent. A device online at that
    /// point subscribed before it went online, so the live publish reaches
    /// it. Every other device is queued before the live publish, so a socket
    /// connecting in between either drains the event or receives it live.
    ///
    /// Enqueue and publish are independent steps; one failing does not stop
    /// the other. The first error is returned.
    pub async fn publish(&self, event: &SyncEvent) -> Result<PublishReport, StoreError> {
        let online: HashSet<Uuid> = self
            .presence
            .list_online_devices(event.user_id)
            .await
            .into_iter()
            .collect();
        let members = self.presence.list_all_devices(event.user_id).await;

        let mut first_error = None;
        let mut report = PublishReport::default();
        for device_id in members {
            if event.is_from(device_id) || online.contains(&device_id) {
                continue;
            }
            match self.offline.enqueue(device_id, event).await {
                Ok(()) => report.queued_for.push(device_id),
                Err(e) => {
                    error!(device_id = %device_id, "Offline enqueue failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.bus.publish(event).await {
            error!(user_id = %event.user_id, event_id = %event.id, "Bus publish failed: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceState, NewNotification, Notification};

    fn notification(user_id: Uuid, device_id: Uuid) -> Notification {
        NewNotification {
            local_id: None,
            app_name: "Bank".into(),
            title: "OTP Code".into(),
            body: "123456".into(),
            category: None,
            priority: None,
            created_at: None,
        }
        .into_notification(user_id, device_id, OffsetDateTime::now_utc())
    }

    #[tokio::test]
    async fn test_channels_are_per_user() {
        let bus = Bus::local(16);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice_rx = bus.subscribe(alice).await;
        let mut bob_rx = bus.subscribe(bob).await;

        let event = SyncEvent::new_notification(&notification(alice, Uuid::new_v4()), None);
        bus.publish(&event).await.unwrap();

        assert_eq!(alice_rx.recv().await.unwrap().into_event().unwrap().id, event.id);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prune_forgets_idle_channels() {
        let bus = Bus::local(16);
        let user = Uuid::new_v4();
        let rx = bus.subscribe(user).await;
        bus.prune(user).await;
        assert_eq!(bus.subscribers().subscriber_count(user).await, 1);
        drop(rx);
        bus.prune(user).await;
        assert_eq!(bus.subscribers().subscriber_count(user).await, 0);
    }

    #[tokio::test]
    async fn test_device_status_reaches_user_channel() {
        let bus = Bus::local(16);
        let (user, device) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx = bus.subscribe(user).await;

        bus.publish_device_status(DeviceStatus::new(user, device, DeviceState::Online))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert!(message.is_from(device));
        match message {
            BusMessage::DeviceStatus(status) => assert_eq!(status.status, DeviceState::Online),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fanout_queues_only_offline_non_origin_devices() {
        let presence = PresenceTracker::new(Duration::from_secs(60), Duration::from_secs(300));
        let offline = OfflineQueue::memory(100);
        let bus = Bus::local(16);
        let fanout = Fanout::new(bus.clone(), presence.clone(), offline.clone());

        let user = Uuid::new_v4();
        let (origin, online, away) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        presence.register_device(user, origin).await;
        presence.register_device(user, away).await;
        presence.add_device(user, online, Uuid::new_v4()).await;
        let mut online_rx = bus.subscribe(user).await;

        let event = SyncEvent::new_notification(&notification(user, origin), Some(origin));
        let report = fanout.publish(&event).await.unwrap();

        assert_eq!(report.queued_for, vec![away]);
        assert_eq!(online_rx.recv().await.unwrap().into_event().unwrap().id, event.id);
        assert_eq!(offline.len(away).await.unwrap(), 1);
        assert_eq!(offline.len(origin).await.unwrap(), 0);
        assert_eq!(offline.len(online).await.unwrap(), 0);
    }
}
