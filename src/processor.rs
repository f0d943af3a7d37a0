use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Fanout;
use crate::error::{ActionError, StoreError};
use crate::metrics;
use crate::models::{
    ActionRecord, BatchCreateResult, EditRequest, EditResponse, NewNotification, Notification,
    NotificationAction, NotificationStatus, PatchField, SyncEvent,
};
use crate::offline_queue::OfflineQueue;
use crate::status_cache::StatusCache;
use crate::store::RecordStore;

/// Server-side entry point for every notification mutation.
#[derive(Clone)]
pub struct ActionProcessor {
    store: RecordStore,
    statuses: StatusCache,
    fanout: Fanout,
    offline: OfflineQueue,
}

impl ActionProcessor {
    pub fn new(
        store: RecordStore,
        statuses: StatusCache,
        fanout: Fanout,
        offline: OfflineQueue,
    ) -> Self {
        Self {
            store,
            statuses,
            fanout,
            offline,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Stores a notification captured on `device_id` and announces it. A
    /// retried create with the same local id returns the stored record
    /// without publishing again.
    pub async fn create_notification(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        payload: NewNotification,
    ) -> Result<Notification, ActionError> {
        payload.validate()?;
        self.check_device(user_id, device_id).await?;

        let candidate = payload.into_notification(user_id, device_id, OffsetDateTime::now_utc());
        let stored = self.store.insert_notification(&candidate).await?;
        if stored.id != candidate.id {
            debug!(notification_id = %stored.id, "Duplicate create ignored");
            return Ok(stored);
        }

        metrics::NOTIFICATIONS_CREATED.inc();
        self.statuses.put(stored.status()).await;
        info!(
            user_id = %user_id,
            device_id = %device_id,
            notification_id = %stored.id,
            app = %stored.app_name,
            "Notification created"
        );

        self.announce(SyncEvent::new_notification(&stored, Some(device_id)))
            .await;
        Ok(stored)
    }

    /// Creates each payload independently; one failure does not sink the
    /// others.
    pub async fn create_batch(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        payloads: Vec<NewNotification>,
    ) -> Vec<BatchCreateResult> {
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let local_id = payload.local_id;
            let result = match self.create_notification(user_id, device_id, payload).await {
                Ok(notification) => BatchCreateResult {
                    local_id,
                    notification: Some(notification),
                    error: None,
                    retryable: false,
                },
                Err(e) => BatchCreateResult {
                    local_id,
                    notification: None,
                    retryable: e.is_retryable(),
                    error: Some(e.to_string()),
                },
            };
            results.push(result);
        }
        results
    }

    /// Applies a read/dismiss/click. Re-applying an action that already
    /// holds is not an error: it is still recorded and still published.
    pub async fn apply_action(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        device_id: Uuid,
        action: NotificationAction,
    ) -> Result<Notification, ActionError> {
        let started = Instant::now();
        let result = self
            .apply_action_inner(user_id, notification_id, device_id, action)
            .await;
        metrics::ACTION_PROCESSING_TIME.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => metrics::ACTIONS_APPLIED
                .with_label_values(&[action.as_str()])
                .inc(),
            Err(e) => {
                metrics::ACTIONS_REJECTED
                    .with_label_values(&[rejection_reason(e)])
                    .inc();
                warn!(
                    user_id = %user_id,
                    device_id = %device_id,
                    notification_id = %notification_id,
                    action = action.as_str(),
                    "Action rejected: {}",
                    e
                );
            }
        }
        result
    }

    async fn apply_action_inner(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        device_id: Uuid,
        action: NotificationAction,
    ) -> Result<Notification, ActionError> {
        let now = OffsetDateTime::now_utc();
        let mut notification = self.load_owned(user_id, notification_id, now).await?;
        self.check_device(user_id, device_id).await?;

        if notification.apply_action(action) {
            notification.updated_at = next_modification(notification.updated_at, now);
            self.store.save_notification(&notification).await?;
        }
        self.statuses.put(notification.status()).await;

        self.store
            .record_action(&ActionRecord {
                id: Uuid::new_v4(),
                notification_id,
                device_id,
                action_type: action,
                timestamp: now,
            })
            .await?;

        debug!(
            notification_id = %notification_id,
            device_id = %device_id,
            action = action.as_str(),
            is_read = notification.is_read,
            is_dismissed = notification.is_dismissed,
            "Action applied"
        );

        self.announce(SyncEvent::status_sync(
            &notification,
            Some(device_id),
            Some(action),
        ))
        .await;
        Ok(notification)
    }

    /// Local deletes become a server-side dismiss; the record survives.
    pub async fn dismiss_for_delete(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        device_id: Uuid,
    ) -> Result<Notification, ActionError> {
        self.apply_action(user_id, notification_id, device_id, NotificationAction::Dismissed)
            .await
    }

    /// Applies a field edit unless the record moved on since the device
    /// last saw it and a concurrent change touched one of the edited fields.
    /// In that case nothing is written and the current record comes back
    /// with `conflict = true`.
    pub async fn update_notification(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        device_id: Uuid,
        request: EditRequest,
    ) -> Result<EditResponse, ActionError> {
        request.patch.validate()?;
        let now = OffsetDateTime::now_utc();
        let mut notification = self.load_owned(user_id, notification_id, now).await?;
        self.check_device(user_id, device_id).await?;

        if !request.force {
            let conflicting = conflicting_fields(&notification, &request);
            if !conflicting.is_empty() {
                metrics::EDIT_CONFLICTS.inc();
                info!(
                    notification_id = %notification_id,
                    device_id = %device_id,
                    fields = ?conflicting,
                    "Edit conflicts with a newer server change"
                );
                return Ok(EditResponse {
                    conflict: true,
                    notification,
                });
            }
        }

        if request.patch.apply_to(&mut notification) {
            let stamped = request.timestamp.min(now);
            notification.updated_at = next_modification(notification.updated_at, stamped);
            self.store.save_notification(&notification).await?;
            self.statuses.put(notification.status()).await;
            self.announce(SyncEvent::status_sync(&notification, Some(device_id), None))
                .await;
        }

        Ok(EditResponse {
            conflict: false,
            notification,
        })
    }

    /// Unexpired notifications changed after `since`. Reconnecting devices
    /// use this to catch anything the bus or their offline queue missed.
    pub async fn changes_since(
        &self,
        user_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<Vec<Notification>, ActionError> {
        Ok(self
            .store
            .changes_since(user_id, since, OffsetDateTime::now_utc())
            .await?)
    }

    /// The notification's action audit trail, oldest first.
    pub async fn action_history(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<Vec<ActionRecord>, ActionError> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or(ActionError::NotFound(notification_id))?;
        if notification.user_id != user_id {
            return Err(ActionError::Forbidden(format!(
                "notification {} belongs to another user",
                notification_id
            )));
        }
        Ok(self.store.list_actions(notification_id).await?)
    }

    /// Served from the status cache when possible; the store is only read
    /// on a miss.
    pub async fn status(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<NotificationStatus, ActionError> {
        let status = match self.statuses.get(notification_id) {
            Some(status) => status,
            None => {
                let notification = self
                    .store
                    .get_notification(notification_id)
                    .await?
                    .ok_or(ActionError::NotFound(notification_id))?;
                let status = notification.status();
                self.statuses.put(status).await;
                status
            }
        };
        if status.user_id != user_id {
            return Err(ActionError::Forbidden(format!(
                "notification {} belongs to another user",
                notification_id
            )));
        }
        Ok(status)
    }

    /// Hard-deletes expired notifications along with their queued messages
    /// and cached status.
    pub async fn cleanup_expired(&self, now: OffsetDateTime) -> Result<usize, StoreError> {
        let deleted = self.store.delete_expired(now).await?;
        if !deleted.is_empty() {
            self.offline.purge_notifications(&deleted).await?;
            self.statuses.invalidate_many(&deleted).await;
        }
        let stale = self.offline.purge_expired(now).await?;
        metrics::EXPIRED_DELETED.inc_by(deleted.len() as u64);
        info!(
            notifications = deleted.len(),
            queued_messages = stale,
            "Expired notification cleanup finished"
        );
        Ok(deleted.len())
    }

    async fn load_owned(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Notification, ActionError> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or(ActionError::NotFound(notification_id))?;
        if notification.user_id != user_id {
            return Err(ActionError::Forbidden(format!(
                "notification {} belongs to another user",
                notification_id
            )));
        }
        if notification.is_expired_at(now) {
            return Err(ActionError::Expired(notification_id));
        }
        Ok(notification)
    }

    async fn check_device(&self, user_id: Uuid, device_id: Uuid) -> Result<(), ActionError> {
        match self.store.get_device(device_id).await? {
            Some(device) if device.user_id == user_id => Ok(()),
            Some(_) => Err(ActionError::Forbidden(format!(
                "device {} belongs to another user",
                device_id
            ))),
            None => Err(ActionError::Forbidden(format!(
                "device {} is not registered",
                device_id
            ))),
        }
    }

    // The write already happened. Delivery gaps from here are covered by
    // reconnect-time pulls.
    async fn announce(&self, event: SyncEvent) {
        if let Err(e) = self.fanout.publish(&event).await {
            warn!(
                user_id = %event.user_id,
                event_id = %event.id,
                notification_id = %event.notification.id,
                "Event not fully delivered: {}",
                e
            );
        }
    }
}

/// Edited fields a concurrent writer changed since the device's base.
fn conflicting_fields(server: &Notification, request: &EditRequest) -> Vec<PatchField> {
    let base = request.base_updated_at.unwrap_or(server.created_at);
    if server.updated_at <= base {
        return Vec::new();
    }
    request
        .patch
        .differing_fields(server)
        .into_iter()
        .filter(|field| match &request.previous {
            Some(previous) => previous
                .get(*field)
                .map_or(true, |seen| seen != server.field(*field)),
            None => true,
        })
        .collect()
}

/// Modification stamps strictly increase so a later base comparison always
/// sees the change.
fn next_modification(current: OffsetDateTime, proposed: OffsetDateTime) -> OffsetDateTime {
    proposed.max(current + time::Duration::milliseconds(1))
}

fn rejection_reason(e: &ActionError) -> &'static str {
    match e {
        ActionError::NotFound(_) => "not_found",
        ActionError::Expired(_) => "expired",
        ActionError::InvalidAction(_) | ActionError::Invalid(_) => "invalid",
        ActionError::Forbidden(_) => "forbidden",
        ActionError::Transient(_) => "transient",
    }
}
