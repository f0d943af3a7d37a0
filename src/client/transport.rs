use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::api::ErrorBody;
use crate::error::TransportError;
use crate::models::{
    ActionRequest, BatchCreateResult, EditRequest, EditResponse, NewNotification, Notification,
    NotificationAction,
};

/// How the sync engine reaches the server. Every call is made on behalf of
/// one authenticated device.
#[trait_variant::make(SyncTransport: Send)]
pub trait LocalSyncTransport {
    async fn is_reachable(&self) -> bool;

    async fn create_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, TransportError>;

    async fn create_batch(
        &self,
        notifications: &[NewNotification],
    ) -> Result<Vec<BatchCreateResult>, TransportError>;

    async fn apply_action(
        &self,
        notification_id: Uuid,
        action: NotificationAction,
    ) -> Result<Notification, TransportError>;

    async fn update_notification(
        &self,
        notification_id: Uuid,
        request: &EditRequest,
    ) -> Result<EditResponse, TransportError>;

    /// Server side of a local delete.
    async fn dismiss(&self, notification_id: Uuid) -> Result<Notification, TransportError>;

    async fn changes_since(
        &self,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<Notification>, TransportError>;
}

/// REST transport authenticating with the device's bearer token.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, TransportError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string()));
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
        };
        debug!(status = status.as_u16(), message = %message, "Request failed");
        Err(classify(status, message))
    }
}

/// Server errors and throttling may clear up; every other failure status
/// means the request itself is wrong.
fn classify(status: StatusCode, message: String) -> TransportError {
    let code = status.as_u16();
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        TransportError::Server {
            status: code,
            message,
        }
    } else {
        TransportError::Rejected {
            status: code,
            message,
        }
    }
}

impl SyncTransport for HttpTransport {
    async fn is_reachable(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    async fn create_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, TransportError> {
        self.send(self.client.post(self.url("/notifications")).json(notification))
            .await
    }

    async fn create_batch(
        &self,
        notifications: &[NewNotification],
    ) -> Result<Vec<BatchCreateResult>, TransportError> {
        self.send(
            self.client
                .post(self.url("/notifications/batch"))
                .json(notifications),
        )
        .await
    }

    async fn apply_action(
        &self,
        notification_id: Uuid,
        action: NotificationAction,
    ) -> Result<Notification, TransportError> {
        self.send(
            self.client
                .post(self.url(&format!("/notifications/{}/actions", notification_id)))
                .json(&ActionRequest { action }),
        )
        .await
    }

    async fn update_notification(
        &self,
        notification_id: Uuid,
        request: &EditRequest,
    ) -> Result<EditResponse, TransportError> {
        self.send(
            self.client
                .patch(self.url(&format!("/notifications/{}", notification_id)))
                .json(request),
        )
        .await
    }

    async fn dismiss(&self, notification_id: Uuid) -> Result<Notification, TransportError> {
        self.send(
            self.client
                .post(self.url(&format!("/notifications/{}/dismiss", notification_id))),
        )
        .await
    }

    async fn changes_since(
        &self,
        since: Option<OffsetDateTime>,
    ) -> Result<Vec<Notification>, TransportError> {
        let mut request = self.client.get(self.url("/notifications/changes"));
        if let Some(since) = since {
            let since = since
                .format(&Rfc3339)
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            request = request.query(&[("since", since)]);
        }
        self.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify(StatusCode::GONE, "expired".into()).is_permanent());
        assert!(classify(StatusCode::FORBIDDEN, "no".into()).is_permanent());
        assert!(!classify(StatusCode::SERVICE_UNAVAILABLE, "busy".into()).is_permanent());
        assert!(!classify(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).is_permanent());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let transport =
            HttpTransport::new("http://localhost:3000/", "token", Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.url("/notifications"),
            "http://localhost:3000/notifications"
        );
    }
}
