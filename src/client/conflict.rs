use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::queue::PendingEdit;
use crate::config::ConflictStrategy;
use crate::models::{Notification, PatchField};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The pending edit is re-sent with `force`.
    LocalWins,
    /// The pending edit is dropped and the server copy adopted.
    ServerWins,
    /// Fields the server did not touch stay pending; the rest follow the server.
    Merged,
}

/// Log entry kept for every resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub notification_id: Uuid,
    pub local_id: Uuid,
    pub resolution: Resolution,
    pub strategy: ConflictStrategy,
    pub fields: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub resolved_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub resolution: Resolution,
    /// Fields that remain in the pending edit.
    pub keep: Vec<PatchField>,
    /// Fields where the two sides disagree.
    pub conflicting: Vec<PatchField>,
}

impl Decision {
    pub fn force(&self) -> bool {
        self.resolution == Resolution::LocalWins
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Decides between a pending local edit and the server's current copy.
    /// Returns `None` when the two do not actually disagree.
    pub fn resolve(&self, edit: &PendingEdit, server: &Notification) -> Option<Decision> {
        let mut clean = Vec::new();
        let mut conflicting = Vec::new();
        for field in edit.patch.differing_fields(server) {
            let untouched = edit.previous.get(field) == Some(server.field(field));
            if untouched {
                clean.push(field);
            } else {
                conflicting.push(field);
            }
        }
        if conflicting.is_empty() {
            return None;
        }

        let local_wins = match self.strategy {
            ConflictStrategy::ClientWins => true,
            ConflictStrategy::ServerWins => false,
            // ties go to the server
            ConflictStrategy::Timestamp => edit.timestamp > server.updated_at,
        };

        let decision = if local_wins {
            let mut keep = clean;
            keep.extend(conflicting.iter().copied());
            Decision {
                resolution: Resolution::LocalWins,
                keep,
                conflicting,
            }
        } else if self.strategy == ConflictStrategy::ServerWins || clean.is_empty() {
            Decision {
                resolution: Resolution::ServerWins,
                keep: Vec::new(),
                conflicting,
            }
        } else {
            Decision {
                resolution: Resolution::Merged,
                keep: clean,
                conflicting,
            }
        };
        Some(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewNotification, NotificationPatch};
    use std::time::Duration;

    fn server_copy() -> Notification {
        NewNotification {
            local_id: None,
            app_name: "Chat".into(),
            title: "Ping".into(),
            body: "hello".into(),
            category: None,
            priority: None,
            created_at: None,
        }
        .into_notification(Uuid::new_v4(), Uuid::new_v4(), OffsetDateTime::now_utc())
    }

    fn edit(server: &Notification, patch: NotificationPatch, at: OffsetDateTime) -> PendingEdit {
        let mut original = server.clone();
        original.title = "Ping".into();
        original.body = "hello".into();
        PendingEdit {
            previous: NotificationPatch::capture(&original, &patch.fields()),
            patch,
            base_updated_at: Some(server.created_at),
            timestamp: at,
            force: false,
        }
    }

    #[test]
    fn test_timestamp_strategy_prefers_later_edit() {
        let mut server = server_copy();
        server.title = "Server title".into();
        server.updated_at += Duration::from_secs(10);

        let resolver = ConflictResolver::new(ConflictStrategy::Timestamp);
        let patch = NotificationPatch {
            title: Some("Local title".into()),
            ..Default::default()
        };

        let later = edit(&server, patch.clone(), server.updated_at + Duration::from_secs(1));
        let decision = resolver.resolve(&later, &server).unwrap();
        assert_eq!(decision.resolution, Resolution::LocalWins);
        assert!(decision.force());

        let tie = edit(&server, patch, server.updated_at);
        let decision = resolver.resolve(&tie, &server).unwrap();
        assert_eq!(decision.resolution, Resolution::ServerWins);
        assert!(decision.keep.is_empty());
        assert_eq!(decision.conflicting, vec![PatchField::Title]);
    }

    #[test]
    fn test_merge_keeps_fields_server_left_alone() {
        let mut server = server_copy();
        server.title = "Server title".into();
        server.updated_at += Duration::from_secs(10);

        let patch = NotificationPatch {
            title: Some("Local title".into()),
            body: Some("local body".into()),
            ..Default::default()
        };
        let pending = edit(&server, patch, server.created_at);
        let decision = ConflictResolver::new(ConflictStrategy::Timestamp)
            .resolve(&pending, &server)
            .unwrap();
        assert_eq!(decision.resolution, Resolution::Merged);
        assert_eq!(decision.keep, vec![PatchField::Body]);
        assert_eq!(decision.conflicting, vec![PatchField::Title]);
    }

    #[test]
    fn test_no_conflict_when_server_matches() {
        let mut server = server_copy();
        server.title = "Same".into();
        let patch = NotificationPatch {
            title: Some("Same".into()),
            ..Default::default()
        };
        let pending = edit(&server, patch, server.created_at);
        for strategy in [
            ConflictStrategy::Timestamp,
            ConflictStrategy::ClientWins,
            ConflictStrategy::ServerWins,
        ] {
            assert!(ConflictResolver::new(strategy).resolve(&pending, &server).is_none());
        }
    }

    #[test]
    fn test_fixed_strategies() {
        let mut server = server_copy();
        server.body = "server body".into();
        let patch = NotificationPatch {
            body: Some("local body".into()),
            ..Default::default()
        };
        let pending = edit(&server, patch, server.created_at);
        assert_eq!(
            ConflictResolver::new(ConflictStrategy::ClientWins)
                .resolve(&pending, &server)
                .unwrap()
                .resolution,
            Resolution::LocalWins
        );
        assert_eq!(
            ConflictResolver::new(ConflictStrategy::ServerWins)
                .resolve(&pending, &server)
                .unwrap()
                .resolution,
            Resolution::ServerWins
        );
    }
}
