//! Device-side sync engine: records local changes, pushes them to the server
//! with retry and backoff, and folds remote changes into the local copies.
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::conflict::{ConflictRecord, ConflictResolver};
use crate::client::queue::{
    Change, ClientStore, LocalNotification, PendingEdit, SyncOperation, SyncPayload,
    SyncQueueItem,
};
use crate::client::transport::SyncTransport;
use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::models::{
    BatchCreateResult, EditRequest, NewNotification, Notification, NotificationAction,
    NotificationPatch, PatchField, SyncEvent,
};

const REMOTE_EVENT_BUFFER: usize = 256;

/// Counts for one `sync_now` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Nothing was attempted: another pass was running, sync is disabled or
    /// the server was unreachable.
    pub skipped: bool,
    pub pushed: usize,
    pub failed: usize,
    /// Items waiting on their notification's create.
    pub deferred: usize,
    /// Items still inside their backoff window.
    pub waiting: usize,
    pub abandoned: usize,
    pub conflicts: usize,
    pub pulled: usize,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    pub pending_items: usize,
    pub abandoned_items: usize,
    pub synced_items: u64,
    pub failed_attempts: u64,
    pub conflicts: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub is_syncing: bool,
    /// Items were abandoned and need the user's attention.
    pub manual_sync_needed: bool,
}

#[derive(Default)]
struct EngineState {
    conflicts: Vec<ConflictRecord>,
    abandoned: Vec<SyncQueueItem>,
    synced: u64,
    failed: u64,
    last_sync_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    /// Newest server `updated_at` seen by a pull.
    watermark: Option<OffsetDateTime>,
}

/// Working set of a single push pass.
#[derive(Default)]
struct Pass {
    report: SyncReport,
    /// Local ids whose create is still queued.
    creating: HashSet<Uuid>,
}

struct Inner<T> {
    transport: T,
    store: ClientStore,
    config: SyncConfig,
    resolver: ConflictResolver,
    device_id: Uuid,
    sync_lock: Mutex<()>,
    /// Set only while a `sync_now` pass runs; remote applies share the lock
    /// but not this flag.
    syncing: AtomicBool,
    state: Mutex<EngineState>,
    remote_tx: mpsc::Sender<SyncEvent>,
    remote_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct SyncEngine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SyncEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SyncTransport + Sync + 'static> SyncEngine<T> {
    pub fn new(
        transport: T,
        store: ClientStore,
        device_id: Uuid,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                resolver: ConflictResolver::new(config.effective_strategy()),
                transport,
                store,
                config,
                device_id,
                sync_lock: Mutex::new(()),
                syncing: AtomicBool::new(false),
                state: Mutex::new(EngineState::default()),
                remote_tx,
                remote_rx: Mutex::new(Some(remote_rx)),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn device_id(&self) -> Uuid {
        self.inner.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ClientStore {
        &self.inner.store
    }

    /// Where the live socket hands over remote events.
    pub fn remote_sender(&self) -> mpsc::Sender<SyncEvent> {
        self.inner.remote_tx.clone()
    }

    /// Stores a notification captured on this device and queues its create.
    /// Calling again with the same local id returns the existing copy.
    pub async fn create_local(
        &self,
        mut notification: NewNotification,
    ) -> Result<LocalNotification, SyncError> {
        notification.validate()?;
        let now = OffsetDateTime::now_utc();
        let local_id = *notification.local_id.get_or_insert_with(Uuid::new_v4);
        if let Some(existing) = self.inner.store.get_local(local_id).await? {
            return Ok(existing);
        }
        notification.created_at.get_or_insert(now);

        let mut record = notification
            .clone()
            .into_notification(Uuid::nil(), self.inner.device_id, now);
        record.id = local_id;
        let local = LocalNotification {
            local_id,
            server_id: None,
            server_updated_at: None,
            deleted: false,
            record,
        };
        self.inner.store.save_local(&local).await?;
        self.queue(local_id, SyncPayload::Create { notification })
            .await?;
        debug!(local_id = %local_id, "Queued local notification");
        Ok(local)
    }

    pub async fn record_action(
        &self,
        local_id: Uuid,
        action: NotificationAction,
    ) -> Result<LocalNotification, SyncError> {
        let mut local = self.load(local_id).await?;
        local.record.apply_action(action);
        self.inner.store.save_local(&local).await?;
        self.queue(
            local_id,
            SyncPayload::Update {
                target: local_id,
                change: Change::Action { action },
            },
        )
        .await?;
        Ok(local)
    }

    /// Edits fields locally and queues the edit. Fields already holding the
    /// requested value are left out.
    pub async fn edit_local(
        &self,
        local_id: Uuid,
        patch: NotificationPatch,
    ) -> Result<LocalNotification, SyncError> {
        patch.validate()?;
        let mut local = self.load(local_id).await?;
        let fields = patch.differing_fields(&local.record);
        if fields.is_empty() {
            return Ok(local);
        }

        let patch = patch.only(&fields);
        let previous = NotificationPatch::capture(&local.record, &fields);
        patch.apply_to(&mut local.record);
        self.inner.store.save_local(&local).await?;
        self.queue(
            local_id,
            SyncPayload::Update {
                target: local_id,
                change: Change::Edit(PendingEdit {
                    patch,
                    previous,
                    base_updated_at: local.server_updated_at,
                    timestamp: OffsetDateTime::now_utc(),
                    force: false,
                }),
            },
        )
        .await?;
        Ok(local)
    }

    /// Removes the notification from this device. Other devices see it
    /// dismissed.
    pub async fn delete_local(&self, local_id: Uuid) -> Result<(), SyncError> {
        let mut local = self.load(local_id).await?;
        if local.deleted {
            return Ok(());
        }
        local.deleted = true;
        local.record.apply_action(NotificationAction::Dismissed);
        self.inner.store.save_local(&local).await?;
        self.queue(local_id, SyncPayload::Delete { target: local_id })
            .await
    }

    pub async fn get_local(&self, local_id: Uuid) -> Result<Option<LocalNotification>, SyncError> {
        Ok(self.inner.store.get_local(local_id).await?)
    }

    pub async fn list_local(&self) -> Result<Vec<LocalNotification>, SyncError> {
        Ok(self.inner.store.list_local().await?)
    }

    pub async fn get_sync_queue(&self) -> Result<Vec<SyncQueueItem>, SyncError> {
        Ok(self.inner.store.list_queue().await?)
    }

    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.state.lock().await.conflicts.clone()
    }

    /// Items dropped after exhausting their retries or being rejected.
    pub async fn abandoned_items(&self) -> Vec<SyncQueueItem> {
        self.inner.state.lock().await.abandoned.clone()
    }

    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        let pending_items = self.inner.store.list_queue().await?.len();
        let is_syncing = self.inner.syncing.load(Ordering::SeqCst);
        let state = self.inner.state.lock().await;
        Ok(SyncStats {
            pending_items,
            abandoned_items: state.abandoned.len(),
            synced_items: state.synced,
            failed_attempts: state.failed,
            conflicts: state.conflicts.len(),
            last_sync_at: state.last_sync_at,
            last_error: state.last_error.clone(),
            is_syncing,
            manual_sync_needed: !state.abandoned.is_empty(),
        })
    }

    /// Runs one push and pull pass. Returns immediately if a pass is already
    /// running.
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        let Ok(_guard) = self.inner.sync_lock.try_lock() else {
            debug!("Sync already in progress");
            return Ok(SyncReport::skipped());
        };
        if !self.inner.config.enabled {
            return Ok(SyncReport::skipped());
        }
        let _syncing = SyncingFlag::raise(&self.inner.syncing);

        let reachable = tokio::time::timeout(
            self.inner.config.request_timeout(),
            self.inner.transport.is_reachable(),
        )
        .await
        .unwrap_or(false);
        if !reachable {
            debug!("Server unreachable, keeping queued changes");
            self.inner.state.lock().await.last_error = Some("server unreachable".into());
            return Ok(SyncReport::skipped());
        }

        let mut pass = Pass::default();
        self.push_queue(&mut pass).await?;
        self.pull_changes(&mut pass).await?;

        let report = pass.report;
        let mut state = self.inner.state.lock().await;
        state.last_sync_at = Some(OffsetDateTime::now_utc());
        if report.failed == 0 {
            state.last_error = None;
        }
        info!(
            pushed = report.pushed,
            failed = report.failed,
            deferred = report.deferred,
            abandoned = report.abandoned,
            conflicts = report.conflicts,
            pulled = report.pulled,
            "Sync pass finished"
        );
        Ok(report)
    }

    /// Applies an event received over the live socket. Events this device
    /// caused and snapshots older than the local copy are ignored.
    pub async fn apply_remote_event(&self, event: SyncEvent) -> Result<bool, SyncError> {
        if event.is_from(self.inner.device_id) {
            debug!(event_id = %event.id, "Ignoring own event");
            return Ok(false);
        }
        let _guard = self.inner.sync_lock.lock().await;
        self.apply_snapshot(event.notification).await
    }

    /// Starts the periodic sync loop and the remote event consumer.
    pub async fn start(&self) -> Result<(), SyncError> {
        let Some(mut remote_rx) = self.inner.remote_rx.lock().await.take() else {
            return Err(SyncError::AlreadyStarted);
        };
        let mut tasks = self.inner.tasks.lock().await;

        let engine = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.inner.config.sync_interval());
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.sync_now().await {
                            error!("Sync pass failed: {}", e);
                        }
                    }
                }
            }
            info!("Sync loop stopped");
        }));

        let engine = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    event = remote_rx.recv() => match event {
                        Some(event) => {
                            if let Err(e) = engine.apply_remote_event(event).await {
                                error!("Failed to apply remote event: {}", e);
                            }
                        }
                        None => break,
                    },
                }
            }
        }));

        info!(device_id = %self.inner.device_id, "Sync engine started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn load(&self, local_id: Uuid) -> Result<LocalNotification, SyncError> {
        self.inner
            .store
            .get_local(local_id)
            .await?
            .ok_or(SyncError::NotFound(local_id))
    }

    async fn queue(&self, local_id: Uuid, payload: SyncPayload) -> Result<(), SyncError> {
        let item = SyncQueueItem::new(local_id, payload);
        self.inner.store.enqueue(&item).await?;
        Ok(())
    }

    async fn timed<R>(
        &self,
        call: impl Future<Output = Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        tokio::time::timeout(self.inner.config.request_timeout(), call)
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout))
    }

    async fn push_queue(&self, pass: &mut Pass) -> Result<(), SyncError> {
        let config = &self.inner.config;
        let now = OffsetDateTime::now_utc();
        let queue = self.inner.store.list_queue().await?;
        pass.creating = queue
            .iter()
            .filter(|item| item.operation() == SyncOperation::Create)
            .map(|item| item.notification_id)
            .collect();

        // at most batch_size items are sent per pass
        let mut budget = config.batch_size;
        let mut index = 0;
        while index < queue.len() && budget > 0 {
            let item = &queue[index];
            if !item.is_eligible(now, config) {
                pass.report.waiting += 1;
                index += 1;
                continue;
            }

            if item.operation() == SyncOperation::Create {
                let limit = if config.enable_batch_optimization {
                    config.batch_size
                } else {
                    1
                };
                let run: Vec<SyncQueueItem> = queue[index..]
                    .iter()
                    .take_while(|next| {
                        next.operation() == SyncOperation::Create && next.is_eligible(now, config)
                    })
                    .take(limit.min(budget))
                    .cloned()
                    .collect();
                index += run.len();
                budget -= run.len();
                self.push_creates(run, pass).await?;
                continue;
            }

            index += 1;
            let Some(local) = self.inner.store.get_local(item.notification_id).await? else {
                self.abandon(item.clone(), "local notification is gone", pass)
                    .await?;
                continue;
            };
            match local.server_id {
                Some(server_id) => {
                    budget -= 1;
                    self.push_update(item.clone(), local, server_id, pass).await?
                }
                None if pass.creating.contains(&item.notification_id) => {
                    pass.report.deferred += 1;
                }
                None => {
                    self.abandon(
                        item.clone(),
                        "notification was never created on the server",
                        pass,
                    )
                    .await?
                }
            }
        }
        Ok(())
    }

    async fn push_creates(&self, items: Vec<SyncQueueItem>, pass: &mut Pass) -> Result<(), SyncError> {
        let payloads: Vec<NewNotification> = items
            .iter()
            .filter_map(|item| match &item.payload {
                SyncPayload::Create { notification } => Some(notification.clone()),
                _ => None,
            })
            .collect();

        if let [payload] = payloads.as_slice() {
            let result = self
                .timed(self.inner.transport.create_notification(payload))
                .await;
            for item in items {
                match &result {
                    Ok(created) => self.on_created(item, created.clone(), pass).await?,
                    Err(e) => self.on_failure(item, e.clone(), pass).await?,
                }
            }
            return Ok(());
        }

        let results = match self.timed(self.inner.transport.create_batch(&payloads)).await {
            Ok(results) => results,
            Err(e) => {
                for item in items {
                    self.on_failure(item, e.clone(), pass).await?;
                }
                return Ok(());
            }
        };
        for item in items {
            let result = results
                .iter()
                .find(|result| result.local_id == Some(item.notification_id));
            match result {
                Some(BatchCreateResult {
                    notification: Some(created),
                    ..
                }) => self.on_created(item, created.clone(), pass).await?,
                Some(result) => {
                    let message = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "batch item failed".into());
                    let err = if result.retryable {
                        TransportError::Server {
                            status: 503,
                            message,
                        }
                    } else {
                        TransportError::Rejected {
                            status: 400,
                            message,
                        }
                    };
                    self.on_failure(item, err, pass).await?;
                }
                None => {
                    self.on_failure(
                        item,
                        TransportError::Decode("batch response is missing an item".into()),
                        pass,
                    )
                    .await?
                }
            }
        }
        Ok(())
    }

    async fn on_created(
        &self,
        item: SyncQueueItem,
        created: Notification,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        self.inner.store.remove_item(item.id).await?;
        pass.creating.remove(&item.notification_id);
        if let Some(local) = self.inner.store.get_local(item.notification_id).await? {
            debug!(local_id = %item.notification_id, notification_id = %created.id, "Create confirmed");
            self.settle(local, created).await?;
        }
        self.confirmed(pass).await;
        Ok(())
    }

    async fn push_update(
        &self,
        item: SyncQueueItem,
        local: LocalNotification,
        server_id: Uuid,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        if item.pending_edit().is_some() {
            return self.push_edit(item, local, server_id, pass).await;
        }

        let transport = &self.inner.transport;
        let result = match &item.payload {
            SyncPayload::Update {
                change: Change::Action { action },
                ..
            } => self.timed(transport.apply_action(server_id, *action)).await,
            SyncPayload::Delete { .. } => match self.timed(transport.dismiss(server_id)).await {
                // already expired or removed on the server
                Err(TransportError::Rejected {
                    status: 404 | 410, ..
                }) => {
                    self.inner.store.remove_item(item.id).await?;
                    self.confirmed(pass).await;
                    return Ok(());
                }
                other => other,
            },
            _ => return Ok(()),
        };

        match result {
            Ok(server) => {
                self.inner.store.remove_item(item.id).await?;
                self.settle(local, server).await?;
                self.confirmed(pass).await;
                Ok(())
            }
            Err(e) => self.on_failure(item, e, pass).await,
        }
    }

    /// Pushes an edit. A conflict is resolved locally and the survivor
    /// re-sent once in the same pass.
    async fn push_edit(
        &self,
        mut item: SyncQueueItem,
        local: LocalNotification,
        server_id: Uuid,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        for round in 0..2 {
            let Some(edit) = item.pending_edit().cloned() else {
                return Ok(());
            };
            let request = EditRequest {
                patch: edit.patch,
                previous: Some(edit.previous),
                base_updated_at: edit.base_updated_at.or(local.server_updated_at),
                timestamp: edit.timestamp,
                force: edit.force,
            };
            let response = match self
                .timed(self.inner.transport.update_notification(server_id, &request))
                .await
            {
                Ok(response) => response,
                Err(e) => return self.on_failure(item, e, pass).await,
            };

            if !response.conflict {
                self.inner.store.remove_item(item.id).await?;
                self.settle(local, response.notification).await?;
                self.confirmed(pass).await;
                return Ok(());
            }
            if round > 0 {
                break;
            }

            pass.report.conflicts += 1;
            let server = response.notification;
            if !self.resolve_pending(&mut item, &server).await? {
                self.settle(local, server).await?;
                return Ok(());
            }
        }

        let err = TransportError::Server {
            status: 409,
            message: "edit still conflicts after resolution".into(),
        };
        self.on_failure(item, err, pass).await
    }

    /// Reconciles a pending edit with a newer server copy. Persists the
    /// narrowed item and returns whether it is still pending.
    async fn resolve_pending(
        &self,
        item: &mut SyncQueueItem,
        server: &Notification,
    ) -> Result<bool, SyncError> {
        let Some(edit) = item.pending_edit().cloned() else {
            return Ok(true);
        };

        let (keep, force) = match self.inner.resolver.resolve(&edit, server) {
            Some(decision) => {
                let record = ConflictRecord {
                    notification_id: server.id,
                    local_id: item.notification_id,
                    resolution: decision.resolution,
                    strategy: self.inner.resolver.strategy(),
                    fields: decision
                        .conflicting
                        .iter()
                        .map(|field| field.as_str().to_string())
                        .collect(),
                    resolved_at: OffsetDateTime::now_utc(),
                };
                info!(
                    notification_id = %server.id,
                    resolution = ?record.resolution,
                    strategy = record.strategy.as_str(),
                    fields = ?record.fields,
                    "Resolved edit conflict"
                );
                self.inner.state.lock().await.conflicts.push(record);
                let force = decision.force();
                (decision.keep, force)
            }
            // nothing the server changed overlaps; only move the base forward
            None => (edit.patch.differing_fields(server), false),
        };

        if keep.is_empty() {
            self.inner.store.remove_item(item.id).await?;
            return Ok(false);
        }
        if let Some(edit) = item.pending_edit_mut() {
            rebase(edit, &keep, server, force);
        }
        self.inner.store.update_item(item).await?;
        Ok(true)
    }

    async fn on_failure(
        &self,
        mut item: SyncQueueItem,
        err: TransportError,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        item.attempts += 1;
        item.last_attempt_at = Some(OffsetDateTime::now_utc());
        item.last_error = Some(err.to_string());
        pass.report.failed += 1;
        {
            let mut state = self.inner.state.lock().await;
            state.failed += 1;
            state.last_error = Some(err.to_string());
        }

        if err.is_permanent() {
            return self.abandon(item, "rejected by the server", pass).await;
        }
        if item.attempts > self.inner.config.max_retry_attempts {
            return self.abandon(item, "retry limit reached", pass).await;
        }
        warn!(
            item_id = %item.id,
            operation = item.operation().as_str(),
            attempts = item.attempts,
            error = %err,
            "Sync item failed, will retry"
        );
        self.inner.store.update_item(&item).await?;
        Ok(())
    }

    async fn abandon(
        &self,
        mut item: SyncQueueItem,
        reason: &str,
        pass: &mut Pass,
    ) -> Result<(), SyncError> {
        warn!(
            item_id = %item.id,
            local_id = %item.notification_id,
            operation = item.operation().as_str(),
            attempts = item.attempts,
            reason,
            "Abandoning sync item"
        );
        self.inner.store.remove_item(item.id).await?;
        if item.operation() == SyncOperation::Create {
            pass.creating.remove(&item.notification_id);
        }
        if item.last_error.is_none() {
            item.last_error = Some(reason.to_string());
        }
        pass.report.abandoned += 1;
        self.inner.state.lock().await.abandoned.push(item);
        Ok(())
    }

    async fn confirmed(&self, pass: &mut Pass) {
        pass.report.pushed += 1;
        self.inner.state.lock().await.synced += 1;
    }

    async fn pull_changes(&self, pass: &mut Pass) -> Result<(), SyncError> {
        let watermark = self.inner.state.lock().await.watermark;
        // Overlap by a millisecond so equal stamps on other notifications
        // are not skipped; the stale check drops the repeats.
        let since = watermark.map(|at| at - time::Duration::milliseconds(1));
        let changes = match self.timed(self.inner.transport.changes_since(since)).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Failed to pull changes: {}", e);
                self.inner.state.lock().await.last_error = Some(e.to_string());
                return Ok(());
            }
        };

        let mut newest = watermark;
        for server in changes {
            let updated_at = server.updated_at;
            if self.apply_snapshot(server).await? {
                pass.report.pulled += 1;
            }
            newest = Some(newest.map_or(updated_at, |at| at.max(updated_at)));
        }
        self.inner.state.lock().await.watermark = newest;
        Ok(())
    }

    /// Folds a server snapshot into the local store. Caller holds the sync
    /// lock.
    async fn apply_snapshot(&self, server: Notification) -> Result<bool, SyncError> {
        let store = &self.inner.store;
        let mut found = store.find_by_server_id(server.id).await?;
        if found.is_none() && server.source_device_id == self.inner.device_id {
            if let Some(local_id) = server.local_id {
                found = store.get_local(local_id).await?;
            }
        }

        let Some(mut local) = found else {
            debug!(notification_id = %server.id, "Storing remote notification");
            let local = LocalNotification {
                local_id: server.id,
                server_id: Some(server.id),
                server_updated_at: Some(server.updated_at),
                deleted: false,
                record: server,
            };
            store.save_local(&local).await?;
            return Ok(true);
        };

        if local
            .server_updated_at
            .is_some_and(|seen| seen >= server.updated_at)
        {
            debug!(notification_id = %server.id, "Ignoring stale snapshot");
            return Ok(false);
        }

        let pending: Vec<SyncQueueItem> = store
            .list_queue()
            .await?
            .into_iter()
            .filter(|item| item.notification_id == local.local_id)
            .collect();
        for mut item in pending {
            match item.operation() {
                // the create landed but its response never came back
                SyncOperation::Create if local.server_id.is_none() => {
                    local.server_id = Some(server.id);
                    store.remove_item(item.id).await?;
                }
                SyncOperation::Update if item.pending_edit().is_some() => {
                    self.resolve_pending(&mut item, &server).await?;
                }
                _ => {}
            }
        }

        self.settle(local, server).await?;
        Ok(true)
    }

    /// Replaces the local copy with a server snapshot, keeping local values
    /// that still have queued changes.
    async fn settle(
        &self,
        mut local: LocalNotification,
        server: Notification,
    ) -> Result<LocalNotification, SyncError> {
        let pending: Vec<SyncQueueItem> = self
            .inner
            .store
            .list_queue()
            .await?
            .into_iter()
            .filter(|item| item.notification_id == local.local_id)
            .collect();

        let mut merged = server;
        for item in &pending {
            match &item.payload {
                SyncPayload::Update {
                    change: Change::Edit(edit),
                    ..
                } => {
                    for field in edit.patch.fields() {
                        merged.set_field(field, local.record.field(field));
                    }
                }
                SyncPayload::Update { .. } | SyncPayload::Delete { .. } => {
                    merged.is_read |= local.record.is_read;
                    merged.is_dismissed |= local.record.is_dismissed;
                }
                SyncPayload::Create { .. } => {}
            }
        }
        if merged.is_dismissed {
            merged.is_read = true;
        }

        local.server_id = Some(merged.id);
        local.server_updated_at = Some(
            local
                .server_updated_at
                .map_or(merged.updated_at, |seen| seen.max(merged.updated_at)),
        );
        local.record = merged;
        self.inner.store.save_local(&local).await?;
        Ok(local)
    }
}

/// Clears the syncing flag when the pass ends, including on early return.
struct SyncingFlag<'a>(&'a AtomicBool);

impl<'a> SyncingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn rebase(edit: &mut PendingEdit, keep: &[PatchField], server: &Notification, force: bool) {
    edit.patch = edit.patch.only(keep);
    edit.previous = NotificationPatch::capture(server, keep);
    edit.base_updated_at = Some(server.updated_at);
    edit.force = force;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, Fanout};
    use crate::client::conflict::Resolution;
    use crate::config::ConflictStrategy;
    use crate::error::ActionError;
    use crate::models::{BatchCreateResult, Device, EditResponse};
    use crate::offline_queue::OfflineQueue;
    use crate::presence::PresenceTracker;
    use crate::processor::ActionProcessor;
    use crate::status_cache::StatusCache;
    use crate::store::RecordStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Calls the processor directly, standing in for the REST API.
    #[derive(Clone)]
    struct InProcess {
        processor: ActionProcessor,
        user: Uuid,
        device: Uuid,
        reachable: Arc<AtomicBool>,
        failures: Arc<AtomicUsize>,
        /// Calls hang for this long before reaching the processor.
        stall_ms: Arc<AtomicUsize>,
    }

    impl InProcess {
        async fn check(&self) -> Result<(), TransportError> {
            let stall = self.stall_ms.load(Ordering::SeqCst);
            if stall > 0 {
                tokio::time::sleep(Duration::from_millis(stall as u64)).await;
            }
            let injected = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(TransportError::Server {
                    status: 503,
                    message: "injected failure".into(),
                });
            }
            Ok(())
        }
    }

    fn to_transport(e: ActionError) -> TransportError {
        if e.is_retryable() {
            return TransportError::Server {
                status: 503,
                message: e.to_string(),
            };
        }
        let status = match e {
            ActionError::NotFound(_) => 404,
            ActionError::Expired(_) => 410,
            ActionError::Forbidden(_) => 403,
            _ => 400,
        };
        TransportError::Rejected {
            status,
            message: e.to_string(),
        }
    }

    impl SyncTransport for InProcess {
        async fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        async fn create_notification(
            &self,
            notification: &NewNotification,
        ) -> Result<Notification, TransportError> {
            self.check().await?;
            self.processor
                .create_notification(self.user, self.device, notification.clone())
                .await
                .map_err(to_transport)
        }

        async fn create_batch(
            &self,
            notifications: &[NewNotification],
        ) -> Result<Vec<BatchCreateResult>, TransportError> {
            self.check().await?;
            Ok(self
                .processor
                .create_batch(self.user, self.device, notifications.to_vec())
                .await)
        }

        async fn apply_action(
            &self,
            notification_id: Uuid,
            action: NotificationAction,
        ) -> Result<Notification, TransportError> {
            self.check().await?;
            self.processor
                .apply_action(self.user, notification_id, self.device, action)
                .await
                .map_err(to_transport)
        }

        async fn update_notification(
            &self,
            notification_id: Uuid,
            request: &EditRequest,
        ) -> Result<EditResponse, TransportError> {
            self.check().await?;
            self.processor
                .update_notification(self.user, notification_id, self.device, request.clone())
                .await
                .map_err(to_transport)
        }

        async fn dismiss(&self, notification_id: Uuid) -> Result<Notification, TransportError> {
            self.check().await?;
            self.processor
                .dismiss_for_delete(self.user, notification_id, self.device)
                .await
                .map_err(to_transport)
        }

        async fn changes_since(
            &self,
            since: Option<OffsetDateTime>,
        ) -> Result<Vec<Notification>, TransportError> {
            self.check().await?;
            self.processor
                .changes_since(self.user, since.unwrap_or(OffsetDateTime::UNIX_EPOCH))
                .await
                .map_err(to_transport)
        }
    }

    struct Server {
        processor: ActionProcessor,
        user: Uuid,
    }

    fn server() -> Server {
        let store = RecordStore::memory();
        let presence = PresenceTracker::new(Duration::from_secs(60), Duration::from_secs(300));
        let offline = OfflineQueue::memory(100);
        let fanout = Fanout::new(Bus::local(64), presence, offline.clone());
        Server {
            processor: ActionProcessor::new(store, StatusCache::default(), fanout, offline),
            user: Uuid::new_v4(),
        }
    }

    async fn device(server: &Server) -> InProcess {
        let id = Uuid::new_v4();
        server
            .processor
            .store()
            .insert_device(&Device {
                id,
                user_id: server.user,
                name: "phone".into(),
                platform: "test".into(),
                token_hash: String::new(),
                created_at: OffsetDateTime::now_utc(),
                last_seen_at: None,
            })
            .await
            .unwrap();
        InProcess {
            processor: server.processor.clone(),
            user: server.user,
            device: id,
            reachable: Arc::new(AtomicBool::new(true)),
            failures: Arc::new(AtomicUsize::new(0)),
            stall_ms: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn engine(transport: &InProcess) -> SyncEngine<InProcess> {
        engine_with(
            transport,
            SyncConfig {
                max_backoff_delay_ms: 0,
                ..Default::default()
            },
        )
    }

    fn engine_with(transport: &InProcess, config: SyncConfig) -> SyncEngine<InProcess> {
        SyncEngine::new(transport.clone(), ClientStore::memory(), transport.device, config).unwrap()
    }

    fn captured(title: &str) -> NewNotification {
        NewNotification {
            local_id: None,
            app_name: "Bank".into(),
            title: title.into(),
            body: "123456".into(),
            category: None,
            priority: None,
            created_at: None,
        }
    }

    async fn server_copy(server: &Server, id: Uuid) -> Notification {
        server
            .processor
            .store()
            .get_notification(id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_creates_are_batched_and_linked() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);

        let mut locals = Vec::new();
        for title in ["one", "two", "three"] {
            locals.push(engine.create_local(captured(title)).await.unwrap());
        }
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.pushed, 3);
        assert_eq!(report.failed, 0);
        assert!(engine.get_sync_queue().await.unwrap().is_empty());

        for local in locals {
            let synced = engine.get_local(local.local_id).await.unwrap().unwrap();
            let server_id = synced.server_id.unwrap();
            let stored = server_copy(&server, server_id).await;
            assert_eq!(stored.local_id, Some(local.local_id));
            assert_eq!(stored.title, local.record.title);
        }
    }

    #[tokio::test]
    async fn test_pass_sends_at_most_batch_size() {
        let server = server();
        let phone = device(&server).await;
        let config = SyncConfig {
            batch_size: 2,
            max_backoff_delay_ms: 0,
            ..Default::default()
        };
        let engine =
            SyncEngine::new(phone.clone(), ClientStore::memory(), phone.device, config).unwrap();
        for title in ["a", "b", "c"] {
            engine.create_local(captured(title)).await.unwrap();
        }
        assert_eq!(engine.sync_now().await.unwrap().pushed, 2);
        assert_eq!(engine.get_sync_queue().await.unwrap().len(), 1);
        assert_eq!(engine.sync_now().await.unwrap().pushed, 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_queue() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);
        engine.create_local(captured("offline")).await.unwrap();

        phone.reachable.store(false, Ordering::SeqCst);
        let report = engine.sync_now().await.unwrap();
        assert!(report.skipped);
        let queue = engine.get_sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].attempts, 0);

        phone.reachable.store(true, Ordering::SeqCst);
        assert_eq!(engine.sync_now().await.unwrap().pushed, 1);
    }

    #[tokio::test]
    async fn test_update_waits_for_create() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);
        let local = engine.create_local(captured("otp")).await.unwrap();
        engine
            .record_action(local.local_id, NotificationAction::Read)
            .await
            .unwrap();

        phone.failures.store(1, Ordering::SeqCst);
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        let queue = engine.get_sync_queue().await.unwrap();
        assert_eq!(queue[0].attempts, 1);
        assert_eq!(queue[1].attempts, 0);

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.pushed, 2);
        let synced = engine.get_local(local.local_id).await.unwrap().unwrap();
        assert!(server_copy(&server, synced.server_id.unwrap()).await.is_read);
        assert!(synced.record.is_read);
    }

    #[tokio::test]
    async fn test_item_abandoned_after_retry_limit() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);
        engine.create_local(captured("doomed")).await.unwrap();
        phone.failures.store(usize::MAX, Ordering::SeqCst);

        for attempt in 1..=5 {
            engine.sync_now().await.unwrap();
            let queue = engine.get_sync_queue().await.unwrap();
            assert_eq!(queue.len(), 1);
            assert_eq!(queue[0].attempts, attempt);
        }

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert!(engine.get_sync_queue().await.unwrap().is_empty());
        let abandoned = engine.abandoned_items().await;
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].attempts, 6);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.pending_items, 0);
        assert_eq!(stats.abandoned_items, 1);
        assert_eq!(stats.failed_attempts, 6);
        assert!(stats.manual_sync_needed);
    }

    #[tokio::test]
    async fn test_item_inside_backoff_window_is_skipped() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine_with(&phone, SyncConfig::default());
        engine.create_local(captured("retry later")).await.unwrap();

        phone.failures.store(1, Ordering::SeqCst);
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);

        // the first retry is two seconds out
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.waiting, 1);
        assert_eq!(report.pushed, 0);
        assert_eq!(report.failed, 0);
        let queue = engine.get_sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].attempts, 1);
        assert!(!engine.stats().await.unwrap().manual_sync_needed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_attempt() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine_with(
            &phone,
            SyncConfig {
                max_backoff_delay_ms: 0,
                request_timeout_ms: 50,
                ..Default::default()
            },
        );
        engine.create_local(captured("slow")).await.unwrap();

        phone.stall_ms.store(500, Ordering::SeqCst);
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        let queue = engine.get_sync_queue().await.unwrap();
        assert_eq!(queue[0].attempts, 1);
        assert_eq!(queue[0].last_error.as_deref(), Some("request timed out"));

        phone.stall_ms.store(0, Ordering::SeqCst);
        assert_eq!(engine.sync_now().await.unwrap().pushed, 1);
    }

    #[tokio::test]
    async fn test_syncing_flag_tracks_passes_only() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine_with(
            &phone,
            SyncConfig {
                max_backoff_delay_ms: 0,
                request_timeout_ms: 1_000,
                ..Default::default()
            },
        );

        // a remote apply holds the lock without being a sync pass
        {
            let _applying = engine.inner.sync_lock.lock().await;
            assert!(!engine.stats().await.unwrap().is_syncing);
        }

        engine.create_local(captured("pending")).await.unwrap();
        phone.stall_ms.store(200, Ordering::SeqCst);
        let pass = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync_now().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.stats().await.unwrap().is_syncing);

        assert_eq!(pass.await.unwrap().unwrap().pushed, 1);
        assert!(!engine.stats().await.unwrap().is_syncing);
    }

    #[tokio::test]
    async fn test_rejected_item_is_abandoned_at_once() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);
        let local = engine.create_local(captured("expiring")).await.unwrap();
        engine.sync_now().await.unwrap();
        let server_id = engine
            .get_local(local.local_id)
            .await
            .unwrap()
            .unwrap()
            .server_id
            .unwrap();

        let mut expired = server_copy(&server, server_id).await;
        expired.expires_at = OffsetDateTime::now_utc() - Duration::from_secs(1);
        server
            .processor
            .store()
            .save_notification(&expired)
            .await
            .unwrap();

        engine
            .record_action(local.local_id, NotificationAction::Clicked)
            .await
            .unwrap();
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(engine.abandoned_items().await[0].attempts, 1);
    }

    /// Two devices edit the same title while offline, then sync in the order
    /// given. Returns the server's final copy and both engines.
    async fn concurrent_title_edit(
        first_to_sync_edits_last: bool,
    ) -> (Notification, SyncEngine<InProcess>, SyncEngine<InProcess>) {
        concurrent_title_edit_with(first_to_sync_edits_last, ConflictStrategy::Timestamp).await
    }

    async fn concurrent_title_edit_with(
        first_to_sync_edits_last: bool,
        strategy: ConflictStrategy,
    ) -> (Notification, SyncEngine<InProcess>, SyncEngine<InProcess>) {
        let server = server();
        let (x, y) = (device(&server).await, device(&server).await);
        let config = SyncConfig {
            max_backoff_delay_ms: 0,
            conflict_resolution_strategy: strategy,
            ..Default::default()
        };
        let (ex, ey) = (engine_with(&x, config.clone()), engine_with(&y, config));

        let local = ex.create_local(captured("original")).await.unwrap();
        ex.sync_now().await.unwrap();
        ey.sync_now().await.unwrap();
        let server_id = ex
            .get_local(local.local_id)
            .await
            .unwrap()
            .unwrap()
            .server_id
            .unwrap();
        let y_local = ey.store().find_by_server_id(server_id).await.unwrap().unwrap();

        let (early, late) = if first_to_sync_edits_last {
            (&ey, &ex)
        } else {
            (&ex, &ey)
        };
        let early_id = if first_to_sync_edits_last { y_local.local_id } else { local.local_id };
        let late_id = if first_to_sync_edits_last { local.local_id } else { y_local.local_id };

        let title = |t: &str| NotificationPatch {
            title: Some(t.into()),
            ..Default::default()
        };
        early.edit_local(early_id, title("early")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        late.edit_local(late_id, title("late")).await.unwrap();

        // x always syncs first
        ex.sync_now().await.unwrap();
        ey.sync_now().await.unwrap();
        ex.sync_now().await.unwrap();

        (server_copy(&server, server_id).await, ex, ey)
    }

    #[tokio::test]
    async fn test_later_edit_wins_when_synced_last() {
        let (stored, ex, ey) = concurrent_title_edit(false).await;
        assert_eq!(stored.title, "late");

        let conflicts = ey.conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, Resolution::LocalWins);
        assert_eq!(conflicts[0].fields, vec!["title".to_string()]);

        let x_view = ex.list_local().await.unwrap();
        assert_eq!(x_view[0].record.title, "late");
    }

    #[tokio::test]
    async fn test_later_edit_wins_when_synced_first() {
        let (stored, ex, ey) = concurrent_title_edit(true).await;
        assert_eq!(stored.title, "late");

        let conflicts = ey.conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, Resolution::ServerWins);
        assert!(ey.get_sync_queue().await.unwrap().is_empty());

        let y_view = ey.list_local().await.unwrap();
        assert_eq!(y_view[0].record.title, "late");
        assert!(ex.conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_wins_overrides_later_server_edit() {
        // y edited first but syncs last
        let (stored, ex, ey) =
            concurrent_title_edit_with(true, ConflictStrategy::ClientWins).await;
        assert_eq!(stored.title, "early");

        let conflicts = ey.conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, Resolution::LocalWins);
        assert_eq!(conflicts[0].strategy, ConflictStrategy::ClientWins);
        assert!(ey.get_sync_queue().await.unwrap().is_empty());
        assert_eq!(ex.list_local().await.unwrap()[0].record.title, "early");
    }

    #[tokio::test]
    async fn test_server_wins_drops_later_local_edit() {
        let (stored, ex, ey) =
            concurrent_title_edit_with(false, ConflictStrategy::ServerWins).await;
        assert_eq!(stored.title, "early");

        let conflicts = ey.conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, Resolution::ServerWins);
        assert_eq!(conflicts[0].strategy, ConflictStrategy::ServerWins);
        assert!(ey.get_sync_queue().await.unwrap().is_empty());
        assert_eq!(ey.list_local().await.unwrap()[0].record.title, "early");
        assert!(ex.conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_dismisses_on_server() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);
        let local = engine.create_local(captured("spam")).await.unwrap();
        engine.delete_local(local.local_id).await.unwrap();

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.pushed, 2);
        let synced = engine.get_local(local.local_id).await.unwrap().unwrap();
        assert!(synced.deleted);
        let stored = server_copy(&server, synced.server_id.unwrap()).await;
        assert!(stored.is_dismissed && stored.is_read);
    }

    #[tokio::test]
    async fn test_remote_events_skip_own_and_stale() {
        let server = server();
        let (x, y) = (device(&server).await, device(&server).await);
        let (ex, ey) = (engine(&x), engine(&y));

        let local = ex.create_local(captured("shared")).await.unwrap();
        ex.sync_now().await.unwrap();
        let server_id = ex
            .get_local(local.local_id)
            .await
            .unwrap()
            .unwrap()
            .server_id
            .unwrap();
        let created = server_copy(&server, server_id).await;

        let own = SyncEvent::new_notification(&created, Some(x.device));
        assert!(!ex.apply_remote_event(own.clone()).await.unwrap());
        assert!(ey.apply_remote_event(own).await.unwrap());

        let read = server
            .processor
            .apply_action(server.user, server_id, x.device, NotificationAction::Read)
            .await
            .unwrap();
        assert!(ey
            .apply_remote_event(SyncEvent::status_sync(&read, Some(x.device), None))
            .await
            .unwrap());
        // replaying the older snapshot changes nothing
        let stale = SyncEvent::new_notification(&created, Some(x.device));
        assert!(!ey.apply_remote_event(stale).await.unwrap());
        let y_copy = ey.store().find_by_server_id(server_id).await.unwrap().unwrap();
        assert!(y_copy.record.is_read);
    }

    #[tokio::test]
    async fn test_remote_change_rebases_pending_edit() {
        let server = server();
        let (x, y) = (device(&server).await, device(&server).await);
        let (ex, ey) = (engine(&x), engine(&y));

        let local = ex.create_local(captured("otp")).await.unwrap();
        ex.sync_now().await.unwrap();
        ey.sync_now().await.unwrap();
        let server_id = ex.get_local(local.local_id).await.unwrap().unwrap().server_id.unwrap();

        ex.edit_local(
            local.local_id,
            NotificationPatch {
                body: Some("edited on x".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let y_local = ey.store().find_by_server_id(server_id).await.unwrap().unwrap();
        ey.record_action(y_local.local_id, NotificationAction::Read)
            .await
            .unwrap();
        ey.sync_now().await.unwrap();
        let read = server_copy(&server, server_id).await;
        assert!(ex
            .apply_remote_event(SyncEvent::status_sync(&read, Some(y.device), None))
            .await
            .unwrap());

        let x_copy = ex.get_local(local.local_id).await.unwrap().unwrap();
        assert!(x_copy.record.is_read);
        assert_eq!(x_copy.record.body, "edited on x");

        let report = ex.sync_now().await.unwrap();
        assert_eq!(report.conflicts, 0);
        assert_eq!(server_copy(&server, server_id).await.body, "edited on x");
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);
        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(SyncError::AlreadyStarted)));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_wins_over_pending_tick() {
        let server = server();
        let phone = device(&server).await;
        let engine = engine(&phone);
        engine.create_local(captured("queued")).await.unwrap();

        // the loop's first poll sees both the immediate tick and the stop
        engine.start().await.unwrap();
        engine.stop().await;

        assert_eq!(engine.get_sync_queue().await.unwrap().len(), 1);
        assert!(engine.stats().await.unwrap().last_sync_at.is_none());
    }
}
