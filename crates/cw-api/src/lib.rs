//! CorpWire HTTP API
//!
//! Routes inbound platform callbacks to [`CallbackService`]:
//! - `GET /callback/:channel/:tenant_id` - URL ownership handshake
//! - `POST /callback/:channel/:tenant_id` - event delivery
//! - `GET /health` - liveness

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cw_callback::{CallbackError, CallbackQuery, CallbackService, Channel};
use serde::Serialize;
use tracing::{debug, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: CallbackService,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Failure surfaced to the platform. Bodies carry no secret material.
#[derive(Debug)]
pub enum ApiError {
    UnknownChannel(String),
    Callback(CallbackError),
}

impl From<CallbackError> for ApiError {
    fn from(e: CallbackError) -> Self {
        ApiError::Callback(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            ApiError::Callback(CallbackError::Tenant(_)) => StatusCode::NOT_FOUND,
            ApiError::Callback(CallbackError::Signature(_)) => StatusCode::UNAUTHORIZED,
            ApiError::Callback(CallbackError::MissingParameter(_))
            | ApiError::Callback(CallbackError::Decrypt(_))
            | ApiError::Callback(CallbackError::Decode(_)) => StatusCode::BAD_REQUEST,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ApiError::UnknownChannel(_) => "unknown channel",
            ApiError::Callback(CallbackError::Tenant(_)) => "unknown tenant",
            ApiError::Callback(CallbackError::MissingParameter(_)) => "missing parameter",
            ApiError::Callback(CallbackError::Signature(_)) => "invalid signature",
            ApiError::Callback(CallbackError::Decrypt(_)) => "invalid payload",
            ApiError::Callback(CallbackError::Decode(_)) => "malformed payload",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::UnknownChannel(channel) => debug!(channel = %channel, "Callback on unknown channel"),
            ApiError::Callback(e) => warn!(status = status.as_u16(), error = %e, "Callback rejected"),
        }
        (status, self.reason()).into_response()
    }
}

/// Build the router. Tracing layers are added by the binary.
pub fn create_router(service: CallbackService) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/callback/:channel/:tenant_id",
            get(handshake_handler).post(delivery_handler),
        )
        .with_state(AppState { service })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn parse_channel(raw: &str) -> Result<Channel, ApiError> {
    raw.parse().map_err(|_| ApiError::UnknownChannel(raw.to_string()))
}

async fn handshake_handler(
    State(state): State<AppState>,
    Path((channel, tenant_id)): Path<(String, String)>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let channel = parse_channel(&channel)?;
    let plaintext = state.service.handshake(channel, &tenant_id, &query)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], plaintext).into_response())
}

async fn delivery_handler(
    State(state): State<AppState>,
    Path((channel, tenant_id)): Path<(String, String)>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let channel = parse_channel(&channel)?;
    let ack = state.service.deliver(channel, &tenant_id, &query, &body).await?;
    Ok(ack)
}
