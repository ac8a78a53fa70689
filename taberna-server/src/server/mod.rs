mod config;
pub mod events;
pub mod mail;
pub mod push;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
pub use config::{
    AppConfig, BusyHoursConfig, ConfigError, HonorConfig, LifecycleConfig, MailConfig, MailDriver,
    NotificationConfig, PushConfig, RecipientPolicy, ScheduleConfig, TaskSchedule,
    parse_clock_time,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info_span;
use uuid::Uuid;

use crate::maintenance::Maintenance;

#[derive(Clone)]
pub struct AppState {
    pub maintenance: Arc<Maintenance>,
}

impl AppState {
    pub fn new(maintenance: Arc<Maintenance>) -> Self {
        Self { maintenance }
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
        )
    });

    Router::new()
        .route("/healthz", get(health))
        .route("/api/heartbeat", get(api_heartbeat))
        .with_state(state)
        .layer(trace)
        .layer(middleware::from_fn(add_request_id))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResp {
    pub heartbeat: Option<String>,
    pub stale: bool,
    pub tasks: BTreeMap<String, Option<String>>,
}

/// 503 when no heartbeat was written within its TTL.
async fn api_heartbeat(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<HeartbeatResp>), AppError> {
    let heartbeat = state
        .maintenance
        .last_heartbeat()
        .await
        .map_err(AppError::internal)?;
    let tasks = state
        .maintenance
        .task_heartbeats()
        .await
        .map_err(AppError::internal)?;
    let stale = heartbeat.is_none();
    let status = if stale {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(HeartbeatResp {
            heartbeat,
            stale,
            tasks,
        }),
    ))
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(ReqId(rid.clone()));
    let mut resp = next.run(req).await;
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    Internal(String),
}

impl AppError {
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let AppError::Internal(detail) = self;
        // Do not leak internal error details to clients, but log them
        tracing::error!(status = %StatusCode::INTERNAL_SERVER_ERROR, detail = %detail, "request failed");
        let body = Json(ErrorBody {
            error: "internal server error".into(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
