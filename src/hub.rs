use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::Config;
use crate::crypto::TokenAuthenticator;
use crate::error::AuthError;
use crate::metrics;
use crate::models::{DeviceState, DeviceStatus, SyncEvent};
use crate::offline_queue::OfflineQueue;
use crate::presence::PresenceTracker;
use crate::processor::ActionProcessor;
use crate::protocol::{ClientFrame, FrameError, ServerFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Subscribed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub user_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub opened_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub auth_timeout: Duration,
    pub idle_timeout: Duration,
    /// Outbound frames buffered per connection before it counts as a slow
    /// consumer and is dropped.
    pub buffer: usize,
    /// How long a closing connection may spend flushing its buffer.
    pub flush_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            buffer: 256,
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            auth_timeout: config.auth_timeout,
            idle_timeout: config.idle_timeout,
            buffer: config.connection_buffer.max(1),
            ..Self::default()
        }
    }
}

/// Holds every device socket of this process and bridges it to the bus.
pub struct Hub {
    processor: ActionProcessor,
    authenticator: TokenAuthenticator,
    presence: PresenceTracker,
    bus: Bus,
    offline: OfflineQueue,
    config: HubConfig,
    connections: RwLock<HashMap<Uuid, ConnectionInfo>>,
    shutdown: watch::Receiver<bool>,
}

type Outbox = mpsc::Sender<ServerFrame>;

impl Hub {
    pub fn new(
        processor: ActionProcessor,
        authenticator: TokenAuthenticator,
        presence: PresenceTracker,
        bus: Bus,
        offline: OfflineQueue,
        config: HubConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            processor,
            authenticator,
            presence,
            bus,
            offline,
            config,
            connections: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_states(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Runs one device connection to completion. `inbound` yields decoded
    /// client frames; `outbound` receives server frames and is driven by a
    /// dedicated writer task.
    pub async fn serve<S, K>(&self, inbound: S, outbound: K)
    where
        S: Stream<Item = Result<ClientFrame, FrameError>> + Send,
        K: Sink<ServerFrame> + Send + 'static,
        K::Error: Display,
    {
        let connection_id = Uuid::new_v4();
        self.connections.write().await.insert(
            connection_id,
            ConnectionInfo {
                state: ConnectionState::Connecting,
                user_id: None,
                device_id: None,
                opened_at: OffsetDateTime::now_utc(),
            },
        );

        let (tx, rx) = mpsc::channel(self.config.buffer);
        let mut writer = tokio::spawn(write_frames(rx, outbound, connection_id));
        let mut inbound = std::pin::pin!(inbound);

        if *self.shutdown.borrow() {
            push(
                &tx,
                ServerFrame::Error {
                    message: "server shutting down".into(),
                    retryable: true,
                },
            );
        } else if let Some((user_id, device_id)) = self.authenticate(&mut inbound, &tx).await {
            self.run_session(connection_id, user_id, device_id, &mut inbound, &tx)
                .await;
        }

        self.set_state(connection_id, ConnectionState::Closed).await;
        drop(tx);
        if tokio::time::timeout(self.config.flush_timeout, &mut writer)
            .await
            .is_err()
        {
            debug!(connection_id = %connection_id, "Writer did not flush in time");
            writer.abort();
        }
        self.connections.write().await.remove(&connection_id);
    }

    async fn authenticate<S>(&self, inbound: &mut Pin<&mut S>, tx: &Outbox) -> Option<(Uuid, Uuid)>
    where
        S: Stream<Item = Result<ClientFrame, FrameError>>,
    {
        let token = match tokio::time::timeout(self.config.auth_timeout, inbound.next()).await {
            Ok(Some(Ok(ClientFrame::Auth { token }))) => token,
            Ok(Some(Ok(_))) => {
                reject(tx, "first frame must be auth", false);
                return None;
            }
            Ok(Some(Err(e))) => {
                reject(tx, &e.to_string(), false);
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                reject(tx, "authentication timed out", true);
                return None;
            }
        };

        match self.authenticator.verify(&token).await {
            Ok(ids) => Some(ids),
            Err(e) => {
                metrics::AUTH_FAILURES.inc();
                warn!("Socket authentication failed: {}", e);
                reject(tx, &e.to_string(), matches!(e, AuthError::Store(_)));
                None
            }
        }
    }

    async fn run_session<S>(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        device_id: Uuid,
        inbound: &mut Pin<&mut S>,
        tx: &Outbox,
    ) where
        S: Stream<Item = Result<ClientFrame, FrameError>>,
    {
        // Subscribe before going online. Fan-out queues for every device it
        // saw offline before publishing live, so an event racing this
        // connect is drained or received live, possibly both.
        let mut events = self.bus.subscribe(user_id).await;
        self.presence
            .add_device(user_id, device_id, connection_id)
            .await;
        if let Some(info) = self.connections.write().await.get_mut(&connection_id) {
            info.state = ConnectionState::Authenticated;
            info.user_id = Some(user_id);
            info.device_id = Some(device_id);
        }
        if let Err(e) = self
            .processor
            .store()
            .touch_device(device_id, OffsetDateTime::now_utc())
            .await
        {
            warn!(device_id = %device_id, "Failed to record last seen: {}", e);
        }
        metrics::ACTIVE_CONNECTIONS.inc();
        info!(user_id = %user_id, device_id = %device_id, connection_id = %connection_id, "Device connected");
        self.announce(user_id, device_id, DeviceState::Online).await;

        let mut open = push(tx, ServerFrame::AuthAck { user_id, device_id })
            && self.drain_offline(device_id, tx).await;
        self.set_state(connection_id, ConnectionState::Subscribed).await;

        let mut shutdown = self.shutdown.clone();
        let mut deadline = Instant::now() + self.config.idle_timeout;

        while open {
            tokio::select! {
                frame = inbound.next() => match frame {
                    None => {
                        debug!(device_id = %device_id, "Socket closed by device");
                        open = false;
                    }
                    Some(Err(e)) if e.is_fatal() => {
                        debug!(device_id = %device_id, "Socket error: {}", e);
                        open = false;
                    }
                    Some(Err(e)) => {
                        open = push(tx, ServerFrame::Error { message: e.to_string(), retryable: false });
                    }
                    Some(Ok(frame)) => {
                        deadline = Instant::now() + self.config.idle_timeout;
                        self.presence.heartbeat(device_id).await;
                        open = self.handle_frame(user_id, device_id, frame, tx).await;
                    }
                },
                // A frame dropped here is neither delivered nor queued. The
                // device recovers it with a sync_request after reconnecting.
                message = events.recv() => match message {
                    Ok(message) if message.is_from(device_id) => {}
                    Ok(message) => {
                        if !push(tx, ServerFrame::message(message)) {
                            metrics::SLOW_CONSUMER_DROPS.inc();
                            warn!(device_id = %device_id, "Outbound buffer full, dropping connection");
                            open = false;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        metrics::SLOW_CONSUMER_DROPS.inc();
                        warn!(device_id = %device_id, missed, "Connection fell behind the bus, dropping");
                        open = false;
                    }
                    Err(RecvError::Closed) => open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    info!(device_id = %device_id, "Connection idle, closing");
                    open = false;
                }
                _ = shutdown.changed() => {
                    open = false;
                }
            }
        }

        drop(events);
        if self.presence.remove_connection(device_id, connection_id).await {
            self.announce(user_id, device_id, DeviceState::Offline).await;
        }
        self.bus.prune(user_id).await;
        metrics::ACTIVE_CONNECTIONS.dec();
        info!(user_id = %user_id, device_id = %device_id, connection_id = %connection_id, "Device disconnected");
    }

    /// Returns false when the connection should close.
    async fn handle_frame(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        frame: ClientFrame,
        tx: &Outbox,
    ) -> bool {
        match frame {
            ClientFrame::Auth { .. } => push(
                tx,
                ServerFrame::Error {
                    message: "already authenticated".into(),
                    retryable: false,
                },
            ),
            ClientFrame::Ping => push(tx, ServerFrame::Pong),
            ClientFrame::Action {
                notification_id,
                action,
            } => {
                let reply = match self
                    .processor
                    .apply_action(user_id, notification_id, device_id, action)
                    .await
                {
                    Ok(_) => ServerFrame::ActionAck { notification_id },
                    Err(e) => ServerFrame::Error {
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    },
                };
                push(tx, reply)
            }
            ClientFrame::SyncRequest { since } => {
                let since = since.unwrap_or(OffsetDateTime::UNIX_EPOCH);
                match self.processor.changes_since(user_id, since).await {
                    Ok(changes) => {
                        debug!(device_id = %device_id, changes = changes.len(), "Answering sync request");
                        for notification in changes {
                            let frame =
                                ServerFrame::event(SyncEvent::status_sync(&notification, None, None));
                            if tx.send_timeout(frame, self.config.idle_timeout).await.is_err() {
                                return false;
                            }
                        }
                        true
                    }
                    Err(e) => push(
                        tx,
                        ServerFrame::Error {
                            message: e.to_string(),
                            retryable: e.is_retryable(),
                        },
                    ),
                }
            }
        }
    }

    /// Pushes the device's offline backlog. Whatever cannot be handed to the
    /// writer goes back on the queue.
    async fn drain_offline(&self, device_id: Uuid, tx: &Outbox) -> bool {
        let messages = match self.offline.drain(device_id).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(device_id = %device_id, "Failed to drain offline queue: {}", e);
                return true;
            }
        };
        if messages.is_empty() {
            return true;
        }
        info!(device_id = %device_id, count = messages.len(), "Delivering offline backlog");

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            let frame = ServerFrame::event(message.event.clone());
            if tx.send_timeout(frame, self.config.idle_timeout).await.is_err() {
                let mut undelivered = vec![message];
                undelivered.extend(pending);
                warn!(device_id = %device_id, count = undelivered.len(), "Requeueing undelivered backlog");
                if let Err(e) = self.offline.restore(undelivered).await {
                    error!(device_id = %device_id, "Failed to requeue backlog: {}", e);
                }
                return false;
            }
        }
        true
    }

    /// Tells the user's other connected devices about a presence change.
    async fn announce(&self, user_id: Uuid, device_id: Uuid, state: DeviceState) {
        let status = DeviceStatus::new(user_id, device_id, state);
        if let Err(e) = self.bus.publish_device_status(status).await {
            warn!(device_id = %device_id, "Failed to publish device status: {}", e);
        }
    }

    async fn set_state(&self, connection_id: Uuid, state: ConnectionState) {
        if let Some(info) = self.connections.write().await.get_mut(&connection_id) {
            info.state = state;
        }
    }
}

fn push(tx: &Outbox, frame: ServerFrame) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
    }
}

fn reject(tx: &Outbox, message: &str, retryable: bool) {
    push(
        tx,
        ServerFrame::Error {
            message: message.to_string(),
            retryable,
        },
    );
}

async fn write_frames<K>(mut rx: mpsc::Receiver<ServerFrame>, outbound: K, connection_id: Uuid)
where
    K: Sink<ServerFrame>,
    K::Error: Display,
{
    let mut outbound = std::pin::pin!(outbound);
    while let Some(frame) = rx.recv().await {
        if let Err(e) = outbound.send(frame).await {
            debug!(connection_id = %connection_id, "Socket write failed: {}", e);
            return;
        }
        metrics::FRAMES_SENT.inc();
    }
    let _ = outbound.close().await;
}
