use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Router,
};
use futures::{future::ready, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::crypto::{self, TokenAuthenticator, UserTokenVerifier};
use crate::error::{ActionError, AuthError, StoreError};
use crate::hub::{ConnectionState, Hub};
use crate::metrics;
use crate::models::{
    ActionRecord, ActionRequest, BatchCreateResult, Device, EditRequest, EditResponse,
    NewNotification, Notification, NotificationStatus, MAX_BATCH_SIZE,
};
use crate::presence::PresenceTracker;
use crate::processor::ActionProcessor;
use crate::protocol::{self, ClientFrame, FrameError, ServerFrame};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_CONCURRENT_REQUESTS: usize = 1024;

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    #[serde(default)]
    platform: String,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterResponse {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Serialize, Deserialize)]
pub struct DeviceSummary {
    #[serde(flatten)]
    pub device: Device,
    pub online: bool,
}

#[derive(Deserialize)]
struct ChangesQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    since: Option<OffsetDateTime>,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub retryable: bool,
}

pub struct ApiState {
    pub processor: ActionProcessor,
    pub authenticator: TokenAuthenticator,
    pub user_tokens: UserTokenVerifier,
    pub presence: PresenceTracker,
    pub hub: Arc<Hub>,
}

pub fn create_api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/devices", post(register_device).get(list_devices))
        .route("/devices/:id", delete(unregister_device))
        .route("/ws", get(ws_handler))
        .route("/notifications", post(create_notification))
        .route("/notifications/batch", post(create_batch))
        .route("/notifications/changes", get(changes_since))
        .route("/notifications/:id", patch(update_notification))
        .route(
            "/notifications/:id/actions",
            post(apply_action).get(action_history),
        )
        .route("/notifications/:id/dismiss", post(dismiss_notification))
        .route("/notifications/:id/status", get(notification_status))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(CorsLayer::permissive())
}

pub enum ApiError {
    Action(ActionError),
    Auth(AuthError),
    Store(StoreError),
    BadRequest(String),
}

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        Self::Action(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, retryable) = match self {
            Self::Action(e) => {
                let status = match &e {
                    ActionError::NotFound(_) => StatusCode::NOT_FOUND,
                    ActionError::Expired(_) => StatusCode::GONE,
                    ActionError::InvalidAction(_) | ActionError::Invalid(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    ActionError::Forbidden(_) => StatusCode::FORBIDDEN,
                    ActionError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string(), e.is_retryable())
            }
            Self::Auth(AuthError::Store(e)) => {
                error!("Authentication backend failure: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string(), true)
            }
            Self::Auth(e) => (StatusCode::UNAUTHORIZED, e.to_string(), false),
            Self::Store(e) => {
                error!("Store failure: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string(), true)
            }
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message, false),
        };
        (status, Json(ErrorBody { error, retryable })).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)
}

async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<(Uuid, Uuid), ApiError> {
    Ok(state.authenticator.verify(bearer(headers)?).await?)
}

/// A device is enrolled either with a user credential or by another device
/// already registered to the same user.
async fn enrolling_user(state: &ApiState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let token = bearer(headers)?;
    if crypto::parse_token(token).is_some() {
        let (user_id, _) = state.authenticator.verify(token).await?;
        return Ok(user_id);
    }
    Ok(state.user_tokens.verify(token)?)
}

async fn health(State(state): State<Arc<ApiState>>) -> Result<Json<serde_json::Value>, ApiError> {
    state.processor.store().ping().await?;
    let connections = state.hub.connection_states().await;
    let subscribed = connections
        .iter()
        .filter(|info| info.state == ConnectionState::Subscribed)
        .count();
    Ok(Json(serde_json::json!({
        "status": "ok",
        "connections": connections.len(),
        "subscribed": subscribed,
    })))
}

async fn metrics_endpoint() -> String {
    metrics::metrics_handler()
}

async fn register_device(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let user_id = enrolling_user(&state, &headers).await?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("device name is required".into()));
    }

    let device_id = Uuid::new_v4();
    let (token, token_hash) = crypto::generate_token(device_id);
    let device = Device {
        id: device_id,
        user_id,
        name: name.to_string(),
        platform: req.platform,
        token_hash,
        created_at: OffsetDateTime::now_utc(),
        last_seen_at: None,
    };
    state.processor.store().insert_device(&device).await?;
    state.presence.register_device(user_id, device_id).await;
    info!(user_id = %user_id, device_id = %device_id, "Device registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            device_id,
            user_id,
            token,
        }),
    ))
}

async fn list_devices(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceSummary>>, ApiError> {
    let (user_id, _) = authenticate(&state, &headers).await?;
    let devices = state.processor.store().list_user_devices(user_id).await?;
    Ok(Json(
        devices
            .into_iter()
            .map(|device| DeviceSummary {
                online: state.presence.is_online(device.id),
                device,
            })
            .collect(),
    ))
}

async fn unregister_device(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let (user_id, device_id) = authenticate(&state, &headers).await?;
    if id != device_id {
        return Err(ActionError::Forbidden("devices may only unregister themselves".into()).into());
    }
    state.processor.store().delete_device(device_id).await?;
    state.presence.forget_device(user_id, device_id).await;
    info!(user_id = %user_id, device_id = %device_id, "Device unregistered");
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (sink, stream) = socket.split();
    let inbound = stream.filter_map(|message| ready(decode_ws_message(message)));
    let outbound = sink.with(|frame: ServerFrame| ready(encode_ws_frame(&frame)));
    state.hub.serve(inbound, outbound).await;
}

fn decode_ws_message(
    message: Result<Message, axum::Error>,
) -> Option<Result<ClientFrame, FrameError>> {
    match message {
        Ok(Message::Text(text)) => Some(protocol::decode_client(&text)),
        Ok(Message::Binary(bytes)) => Some(serde_json::from_slice(&bytes).map_err(FrameError::from)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Ok(Message::Close(_)) => Some(Err(FrameError::Socket("closed by peer".into()))),
        Err(e) => Some(Err(FrameError::Socket(e.to_string()))),
    }
}

fn encode_ws_frame(frame: &ServerFrame) -> Result<Message, axum::Error> {
    protocol::encode(frame)
        .map(Message::Text)
        .map_err(axum::Error::new)
}

async fn create_notification(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(payload): Json<NewNotification>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let (user_id, device_id) = authenticate(&state, &headers).await?;
    let notification = state
        .processor
        .create_notification(user_id, device_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(notification)))
}

async fn create_batch(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(payloads): Json<Vec<NewNotification>>,
) -> Result<Json<Vec<BatchCreateResult>>, ApiError> {
    let (user_id, device_id) = authenticate(&state, &headers).await?;
    if payloads.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BadRequest(format!(
            "batch limited to {} notifications",
            MAX_BATCH_SIZE
        )));
    }
    Ok(Json(
        state
            .processor
            .create_batch(user_id, device_id, payloads)
            .await,
    ))
}

async fn update_notification(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<EditRequest>,
) -> Result<Json<EditResponse>, ApiError> {
    let (user_id, device_id) = authenticate(&state, &headers).await?;
    let response = state
        .processor
        .update_notification(user_id, id, device_id, request)
        .await?;
    Ok(Json(response))
}

async fn apply_action(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<ActionRequest>,
) -> Result<Json<Notification>, ApiError> {
    let (user_id, device_id) = authenticate(&state, &headers).await?;
    let notification = state
        .processor
        .apply_action(user_id, id, device_id, request.action)
        .await?;
    Ok(Json(notification))
}

async fn action_history(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ActionRecord>>, ApiError> {
    let (user_id, _) = authenticate(&state, &headers).await?;
    Ok(Json(state.processor.action_history(user_id, id).await?))
}

async fn dismiss_notification(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, ApiError> {
    let (user_id, device_id) = authenticate(&state, &headers).await?;
    let notification = state
        .processor
        .dismiss_for_delete(user_id, id, device_id)
        .await?;
    Ok(Json(notification))
}

async fn changes_since(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let (user_id, _) = authenticate(&state, &headers).await?;
    let since = query.since.unwrap_or(OffsetDateTime::UNIX_EPOCH);
    Ok(Json(state.processor.changes_since(user_id, since).await?))
}

async fn notification_status(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationStatus>, ApiError> {
    let (user_id, _) = authenticate(&state, &headers).await?;
    Ok(Json(state.processor.status(user_id, id).await?))
}
