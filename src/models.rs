use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ActionError;

/// Notifications are hard-deleted this long after creation.
pub const NOTIFICATION_TTL: time::Duration = time::Duration::days(7);

/// Most notifications a single batch create may carry.
pub const MAX_BATCH_SIZE: usize = 500;

pub const MAX_APP_NAME_LEN: usize = 255;
pub const MAX_TITLE_LEN: usize = 500;
pub const MAX_BODY_LEN: usize = 2000;

pub const MIN_PRIORITY: i16 = 0;
pub const MAX_PRIORITY: i16 = 3;
pub const DEFAULT_PRIORITY: i16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Work,
    #[default]
    Personal,
    Junk,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Personal => "personal",
            Self::Junk => "junk",
        }
    }
}

impl FromStr for Category {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "work" => Ok(Self::Work),
            "personal" => Ok(Self::Personal),
            "junk" => Ok(Self::Junk),
            other => Err(ActionError::Invalid(format!("unknown category: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Read,
    #[serde(alias = "dismiss")]
    Dismissed,
    #[serde(alias = "click")]
    Clicked,
}

impl NotificationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Dismissed => "dismissed",
            Self::Clicked => "clicked",
        }
    }
}

impl FromStr for NotificationAction {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "dismissed" | "dismiss" => Ok(Self::Dismissed),
            "clicked" | "click" => Ok(Self::Clicked),
            other => Err(ActionError::InvalidAction(other.to_string())),
        }
    }
}

/// A field of a notification that a device may edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchField {
    Title,
    Body,
    Category,
    Priority,
    IsRead,
    IsDismissed,
}

impl PatchField {
    pub const ALL: [PatchField; 6] = [
        Self::Title,
        Self::Body,
        Self::Category,
        Self::Priority,
        Self::IsRead,
        Self::IsDismissed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Body => "body",
            Self::Category => "category",
            Self::Priority => "priority",
            Self::IsRead => "is_read",
            Self::IsDismissed => "is_dismissed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Category(Category),
    Priority(i16),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    #[serde(default)]
    pub local_id: Option<Uuid>,
    pub user_id: Uuid,
    pub source_device_id: Uuid,
    pub app_name: String,
    pub title: String,
    pub body: String,
    pub category: Category,
    pub priority: i16,
    pub is_read: bool,
    pub is_dismissed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Last-modified timestamp. Conflict tie-breaks compare against this.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Notification {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn status(&self) -> NotificationStatus {
        NotificationStatus {
            notification_id: self.id,
            user_id: self.user_id,
            is_read: self.is_read,
            is_dismissed: self.is_dismissed,
            updated_at: self.updated_at,
        }
    }

    /// Moves the status forward for `action`. Returns whether anything changed.
    pub fn apply_action(&mut self, action: NotificationAction) -> bool {
        let before = (self.is_read, self.is_dismissed);
        match action {
            NotificationAction::Read | NotificationAction::Clicked => self.is_read = true,
            NotificationAction::Dismissed => {
                self.is_read = true;
                self.is_dismissed = true;
            }
        }
        before != (self.is_read, self.is_dismissed)
    }

    pub fn field(&self, field: PatchField) -> FieldValue {
        match field {
            PatchField::Title => FieldValue::Text(self.title.clone()),
            PatchField::Body => FieldValue::Text(self.body.clone()),
            PatchField::Category => FieldValue::Category(self.category),
            PatchField::Priority => FieldValue::Priority(self.priority),
            PatchField::IsRead => FieldValue::Flag(self.is_read),
            PatchField::IsDismissed => FieldValue::Flag(self.is_dismissed),
        }
    }

    pub fn set_field(&mut self, field: PatchField, value: FieldValue) {
        match (field, value) {
            (PatchField::Title, FieldValue::Text(v)) => self.title = v,
            (PatchField::Body, FieldValue::Text(v)) => self.body = v,
            (PatchField::Category, FieldValue::Category(v)) => self.category = v,
            (PatchField::Priority, FieldValue::Priority(v)) => self.priority = v,
            (PatchField::IsRead, FieldValue::Flag(v)) => self.is_read = v,
            (PatchField::IsDismissed, FieldValue::Flag(v)) => self.is_dismissed = v,
            _ => {}
        }
    }
}

/// Cached read/dismissed snapshot of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStatus {
    pub notification_id: Uuid,
    pub user_id: Uuid,
    pub is_read: bool,
    pub is_dismissed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Partial edit of a notification's mutable fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dismissed: Option<bool>,
}

impl NotificationPatch {
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    pub fn fields(&self) -> Vec<PatchField> {
        PatchField::ALL
            .into_iter()
            .filter(|field| self.get(*field).is_some())
            .collect()
    }

    pub fn get(&self, field: PatchField) -> Option<FieldValue> {
        match field {
            PatchField::Title => self.title.clone().map(FieldValue::Text),
            PatchField::Body => self.body.clone().map(FieldValue::Text),
            PatchField::Category => self.category.map(FieldValue::Category),
            PatchField::Priority => self.priority.map(FieldValue::Priority),
            PatchField::IsRead => self.is_read.map(FieldValue::Flag),
            PatchField::IsDismissed => self.is_dismissed.map(FieldValue::Flag),
        }
    }

    pub fn set(&mut self, field: PatchField, value: FieldValue) {
        match (field, value) {
            (PatchField::Title, FieldValue::Text(v)) => self.title = Some(v),
            (PatchField::Body, FieldValue::Text(v)) => self.body = Some(v),
            (PatchField::Category, FieldValue::Category(v)) => self.category = Some(v),
            (PatchField::Priority, FieldValue::Priority(v)) => self.priority = Some(v),
            (PatchField::IsRead, FieldValue::Flag(v)) => self.is_read = Some(v),
            (PatchField::IsDismissed, FieldValue::Flag(v)) => self.is_dismissed = Some(v),
            _ => {}
        }
    }

    /// Keeps only the listed fields.
    pub fn only(&self, fields: &[PatchField]) -> Self {
        let mut out = Self::default();
        for field in fields {
            if let Some(value) = self.get(*field) {
                out.set(*field, value);
            }
        }
        out
    }

    /// Snapshot of `fields` as they currently are on `notification`.
    pub fn capture(notification: &Notification, fields: &[PatchField]) -> Self {
        let mut out = Self::default();
        for field in fields {
            out.set(*field, notification.field(*field));
        }
        out
    }

    /// Fields whose patched value differs from the notification's.
    pub fn differing_fields(&self, notification: &Notification) -> Vec<PatchField> {
        self.fields()
            .into_iter()
            .filter(|field| self.get(*field) != Some(notification.field(*field)))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ActionError> {
        if let Some(title) = &self.title {
            check_len("title", title, MAX_TITLE_LEN)?;
        }
        if let Some(body) = &self.body {
            check_len("body", body, MAX_BODY_LEN)?;
        }
        if let Some(priority) = self.priority {
            check_priority(priority)?;
        }
        Ok(())
    }

    /// Applies the patch and restores `is_dismissed => is_read`. Returns
    /// whether the notification changed.
    pub fn apply_to(&self, notification: &mut Notification) -> bool {
        let before = notification.clone();
        for field in self.fields() {
            if let Some(value) = self.get(field) {
                notification.set_field(field, value);
            }
        }
        if self.is_read == Some(false) && self.is_dismissed != Some(true) {
            notification.is_dismissed = false;
        }
        if notification.is_dismissed {
            notification.is_read = true;
        }
        *notification != before
    }
}

/// Payload of `CreateNotification` as captured on a device. Category and
/// priority arrive already classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    #[serde(default)]
    pub local_id: Option<Uuid>,
    pub app_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub priority: Option<i16>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

impl NewNotification {
    pub fn validate(&self) -> Result<(), ActionError> {
        if self.app_name.trim().is_empty() {
            return Err(ActionError::Invalid("app_name is required".into()));
        }
        check_len("app_name", &self.app_name, MAX_APP_NAME_LEN)?;
        check_len("title", &self.title, MAX_TITLE_LEN)?;
        check_len("body", &self.body, MAX_BODY_LEN)?;
        if let Some(priority) = self.priority {
            check_priority(priority)?;
        }
        Ok(())
    }

    pub fn into_notification(
        self,
        user_id: Uuid,
        device_id: Uuid,
        now: OffsetDateTime,
    ) -> Notification {
        // A device clock running ahead must not push expiry further out.
        let created_at = self.created_at.map_or(now, |at| at.min(now));
        Notification {
            id: Uuid::new_v4(),
            local_id: self.local_id,
            user_id,
            source_device_id: device_id,
            app_name: self.app_name.trim().to_string(),
            title: self.title,
            body: self.body,
            category: self.category.unwrap_or_default(),
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            is_read: false,
            is_dismissed: false,
            created_at,
            expires_at: created_at + NOTIFICATION_TTL,
            updated_at: created_at,
        }
    }
}

fn check_len(name: &str, value: &str, max: usize) -> Result<(), ActionError> {
    if value.chars().count() > max {
        return Err(ActionError::Invalid(format!(
            "{} must be {} characters or less",
            name, max
        )));
    }
    Ok(())
}

fn check_priority(priority: i16) -> Result<(), ActionError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(ActionError::Invalid(format!(
            "priority must be between {} and {}",
            MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    Ok(())
}

/// Append-only audit entry for an applied action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub device_id: Uuid,
    pub action_type: NotificationAction,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub platform: String,
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
}

/// Live presence entry for a connected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConnection {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    NewNotification,
    NotificationSync,
}

/// Event fanned out over the bus and stored in offline queues. Carries the
/// full notification snapshot so receivers can apply it idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: SyncEventKind,
    pub user_id: Uuid,
    #[serde(default)]
    pub origin_device_id: Option<Uuid>,
    #[serde(default)]
    pub action: Option<NotificationAction>,
    pub notification: Notification,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SyncEvent {
    pub fn new_notification(notification: &Notification, origin: Option<Uuid>) -> Self {
        Self::build(SyncEventKind::NewNotification, notification, origin, None)
    }

    pub fn status_sync(
        notification: &Notification,
        origin: Option<Uuid>,
        action: Option<NotificationAction>,
    ) -> Self {
        Self::build(SyncEventKind::NotificationSync, notification, origin, action)
    }

    fn build(
        kind: SyncEventKind,
        notification: &Notification,
        origin: Option<Uuid>,
        action: Option<NotificationAction>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id: notification.user_id,
            origin_device_id: origin,
            action,
            notification: notification.clone(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_from(&self, device_id: Uuid) -> bool {
        self.origin_device_id == Some(device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
}

/// Announces that one of the user's devices connected or disconnected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub status: DeviceState,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl DeviceStatus {
    pub fn new(user_id: Uuid, device_id: Uuid, status: DeviceState) -> Self {
        Self {
            user_id,
            device_id,
            status,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Everything that travels over a user's bus channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Event(SyncEvent),
    DeviceStatus(DeviceStatus),
}

impl BusMessage {
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Event(event) => event.user_id,
            Self::DeviceStatus(status) => status.user_id,
        }
    }

    /// True when `device_id` produced this message and must not see it again.
    pub fn is_from(&self, device_id: Uuid) -> bool {
        match self {
            Self::Event(event) => event.is_from(device_id),
            Self::DeviceStatus(status) => status.device_id == device_id,
        }
    }

    pub fn into_event(self) -> Option<SyncEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::DeviceStatus(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub device_id: Uuid,
    pub event: SyncEvent,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Field edit pushed by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    pub patch: NotificationPatch,
    /// Values the device saw for the patched fields before editing. Lets the
    /// server tell a concurrent edit apart from the device's own change.
    #[serde(default)]
    pub previous: Option<NotificationPatch>,
    /// Server `updated_at` the device last observed for this notification.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub base_updated_at: Option<OffsetDateTime>,
    /// When the edit was made on the device.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Apply even if the server record moved on since `base_updated_at`.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditResponse {
    pub conflict: bool,
    pub notification: Notification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: NotificationAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCreateResult {
    #[serde(default)]
    pub local_id: Option<Uuid>,
    #[serde(default)]
    pub notification: Option<Notification>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}
