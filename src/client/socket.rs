use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::models::SyncEvent;
use crate::protocol::{self, ClientFrame, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_RECONNECT_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// e.g. `ws://localhost:3000/ws`
    pub url: String,
    pub token: String,
    pub ping_interval: Duration,
    pub auth_timeout: Duration,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            ping_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

enum Connected {
    Ready(Socket),
    Rejected(String),
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

/// Live connection to the sync hub. Forwards every pushed event to the
/// sync engine and reconnects with backoff until shut down.
pub struct ClientSocket {
    config: SocketConfig,
    events: mpsc::Sender<SyncEvent>,
    shutdown: watch::Receiver<bool>,
    /// Newest `updated_at` received, sent as `since` on reconnect.
    since: Option<OffsetDateTime>,
}

impl ClientSocket {
    pub fn new(
        config: SocketConfig,
        events: mpsc::Sender<SyncEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            events,
            shutdown,
            since: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut reconnect_delay = 1;
        let mut shutdown = self.shutdown.clone();

        'outer: loop {
            if *shutdown.borrow() || self.events.is_closed() {
                break 'outer;
            }

            match self.connect().await {
                Ok(Connected::Ready(socket)) => {
                    info!(url = %self.config.url, "Sync socket connected");
                    reconnect_delay = 1;
                    match self.session(socket).await {
                        Ok(SessionEnd::Shutdown) => break 'outer,
                        Ok(SessionEnd::Dropped) => warn!("Sync socket closed by server"),
                        Err(e) => warn!("Sync socket interrupted: {}", e),
                    }
                }
                Ok(Connected::Rejected(message)) => {
                    return Err(anyhow!("Authentication rejected: {}", message));
                }
                Err(e) => error!("Failed to connect sync socket: {}", e),
            }

            if self.events.is_closed() {
                break 'outer;
            }
            let delay = Duration::from_secs(reconnect_delay);
            reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY_SECS);
            info!("Reconnecting in {} seconds", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => continue 'outer,
                _ = shutdown.changed() => break 'outer,
            }
        }

        info!("Sync socket stopped");
        Ok(())
    }

    /// Opens the socket, authenticates and asks for anything missed since
    /// the last event.
    async fn connect(&self) -> Result<Connected> {
        let (mut socket, _) = connect_async(self.config.url.as_str())
            .await
            .context("websocket handshake failed")?;

        let auth = ClientFrame::Auth {
            token: self.config.token.clone(),
        };
        socket.send(Message::text(protocol::encode(&auth)?)).await?;

        let ack = tokio::time::timeout(self.config.auth_timeout, next_frame(&mut socket))
            .await
            .context("timed out waiting for auth_ack")??;
        match ack {
            Some(ServerFrame::AuthAck { device_id, .. }) => {
                debug!(device_id = %device_id, "Authenticated");
            }
            Some(ServerFrame::Error {
                message,
                retryable: false,
            }) => return Ok(Connected::Rejected(message)),
            Some(other) => return Err(anyhow!("expected auth_ack, got {:?}", other)),
            None => return Err(anyhow!("socket closed during authentication")),
        }

        let request = ClientFrame::SyncRequest { since: self.since };
        socket.send(Message::text(protocol::encode(&request)?)).await?;
        Ok(Connected::Ready(socket))
    }

    async fn session(&mut self, socket: Socket) -> Result<SessionEnd> {
        let (mut sink, mut stream) = socket.split();
        let mut shutdown = self.shutdown.clone();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        return Ok(SessionEnd::Dropped);
                    };
                    match message? {
                        Message::Text(text) => {
                            if !self.handle_frame(text.as_str()).await {
                                let _ = sink.send(Message::Close(None)).await;
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        Message::Close(_) => return Ok(SessionEnd::Dropped),
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    sink.send(Message::text(protocol::encode(&ClientFrame::Ping)?)).await?;
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Returns false once nobody is listening for events.
    async fn handle_frame(&mut self, text: &str) -> bool {
        let frame = match protocol::decode_server(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring malformed frame: {}", e);
                return true;
            }
        };

        match frame {
            ServerFrame::Pong => debug!("pong"),
            ServerFrame::ActionAck { notification_id } => {
                debug!(notification_id = %notification_id, "Action acknowledged");
            }
            ServerFrame::Error { message, retryable } => {
                warn!(retryable, "Server reported error: {}", message);
            }
            ServerFrame::AuthAck { .. } => {}
            ServerFrame::DeviceStatus { data } => {
                debug!(device_id = %data.device_id, status = ?data.status, "Peer device status");
            }
            other => {
                let Some(event) = other.into_event() else {
                    return true;
                };
                let updated_at = event.notification.updated_at;
                self.since = Some(self.since.map_or(updated_at, |at| at.max(updated_at)));
                if self.events.send(event).await.is_err() {
                    return false;
                }
            }
        }
        true
    }
}

async fn next_frame(socket: &mut Socket) -> Result<Option<ServerFrame>> {
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(protocol::decode_server(text.as_str())?)),
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}
