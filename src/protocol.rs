//! JSON text frames exchanged over the device socket.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{BusMessage, DeviceStatus, NotificationAction, SyncEvent, SyncEventKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    Action {
        #[serde(rename = "notificationId", alias = "notification_id")]
        notification_id: Uuid,
        action: NotificationAction,
    },
    Ping,
    SyncRequest {
        #[serde(default, with = "time::serde::rfc3339::option")]
        since: Option<OffsetDateTime>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthAck {
        user_id: Uuid,
        device_id: Uuid,
    },
    NewNotification {
        data: SyncEvent,
    },
    NotificationSync {
        data: SyncEvent,
    },
    DeviceStatus {
        data: DeviceStatus,
    },
    Pong,
    ActionAck {
        #[serde(rename = "notificationId")]
        notification_id: Uuid,
    },
    Error {
        message: String,
        retryable: bool,
    },
}

impl ServerFrame {
    pub fn event(event: SyncEvent) -> Self {
        match event.kind {
            SyncEventKind::NewNotification => Self::NewNotification { data: event },
            SyncEventKind::NotificationSync => Self::NotificationSync { data: event },
        }
    }

    pub fn message(message: BusMessage) -> Self {
        match message {
            BusMessage::Event(event) => Self::event(event),
            BusMessage::DeviceStatus(status) => Self::DeviceStatus { data: status },
        }
    }

    pub fn into_event(self) -> Option<SyncEvent> {
        match self {
            Self::NewNotification { data } | Self::NotificationSync { data } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("socket error: {0}")]
    Socket(String),
}

impl FrameError {
    /// Malformed frames are reported back; socket errors end the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Socket(_))
    }
}

pub fn decode_client(text: &str) -> Result<ClientFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_server(text: &str) -> Result<ServerFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}
