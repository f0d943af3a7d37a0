use thiserror::Error;
use uuid::Uuid;

/// Failures raised by the server-side storage backends (record store,
/// offline queue, postgres bus).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Broad classes of failure, used to decide whether a caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Transient,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("notification {0} not found")]
    NotFound(Uuid),

    #[error("notification {0} has expired")]
    Expired(Uuid),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid notification: {0}")]
    Invalid(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient failure: {0}")]
    Transient(#[from] StoreError),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Expired(_) | Self::InvalidAction(_) | Self::Invalid(_) => {
                ErrorKind::Validation
            }
            Self::Forbidden(_) => ErrorKind::Authorization,
            Self::Transient(_) => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing device token")]
    MissingToken,

    #[error("invalid device token")]
    InvalidToken,

    #[error("authentication backend failure: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced by the client's network transport. A timeout is treated
/// exactly like any other network failure.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Rejections are validation or authorization failures; retrying them
    /// can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unreachable(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientStoreError {
    #[error("local database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("local serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("local notification {0} not found")]
    NotFound(Uuid),

    #[error("corrupt local row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid sync configuration: {0}")]
    Invalid(String),
}

/// Failures of the client sync engine's own operations. Network failures
/// during a sync pass are recorded on queue items instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] ClientStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invalid(#[from] ActionError),

    #[error("local notification {0} not found")]
    NotFound(Uuid),

    #[error("sync engine already started")]
    AlreadyStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_classification() {
        let id = Uuid::new_v4();
        assert_eq!(ActionError::NotFound(id).kind(), ErrorKind::Validation);
        assert_eq!(ActionError::Expired(id).kind(), ErrorKind::Validation);
        assert_eq!(
            ActionError::Forbidden("not yours".into()).kind(),
            ErrorKind::Authorization
        );
        let transient = ActionError::from(StoreError::Unavailable("down".into()));
        assert!(transient.is_retryable());
        assert!(!ActionError::NotFound(id).is_retryable());
    }

    #[test]
    fn test_transport_error_permanence() {
        assert!(TransportError::Rejected {
            status: 410,
            message: "expired".into()
        }
        .is_permanent());
        assert!(!TransportError::Timeout.is_permanent());
        assert!(!TransportError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_permanent());
    }
}
