use std::{future::IntoFuture as _, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Extension, FromRequest, FromRequestParts, Query, Request, State,
        rejection::JsonRejection,
    },
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{debug, error};

use crate::{
    api_key::{API_KEY_HEADER, ApiKey, verify_api_key},
    audit_log::{AuditLog, AuditLogError, MutationRecord, format_timestamp},
    config::Config,
    controller::{ApplyError, StateController},
    domain::{DEFAULT_PAGE, DEFAULT_PAGE_SIZE, DomainError, MutationRequest, State as LiveState},
};


#[derive(Clone)]
pub struct AppState {
    pub controller: StateController,
    pub audit_log: Arc<AuditLog>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", StatusCode::UNAUTHORIZED, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new("payload_too_large", StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn storage_failure(message: impl Into<String>) -> Self {
        Self::new(
            "storage_failure",
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        let err = Self::new(value.code(), StatusCode::BAD_REQUEST, value.to_string());
        match value {
            DomainError::EmptyMutation => err,
            DomainError::InvalidPage { page } => err.with_detail("page", page),
            DomainError::InvalidPageSize { limit } => err.with_detail("limit", limit),
        }
    }
}

impl From<AuditLogError> for ApiError {
    fn from(value: AuditLogError) -> Self {
        match value {
            AuditLogError::Domain(domain) => domain.into(),
            other => ApiError::storage_failure(other.to_string()),
        }
    }
}

impl From<ApplyError> for ApiError {
    fn from(value: ApplyError) -> Self {
        match value {
            ApplyError::InvalidArgument(domain) => domain.into(),
            ApplyError::Storage(storage) => storage.into(),
            ApplyError::Stopped => ApiError::internal(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| {
                // Over-limit bodies surface as a buffering failure with status 413.
                if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    ApiError::payload_too_large(e.body_text())
                } else {
                    ApiError::invalid_request(e.body_text())
                }
            })?;
        Ok(Self(value))
    }
}

pub struct ApiQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S>,
    <Query<T> as FromRequestParts<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: LiveState,
    timestamp: String,
    uptime_seconds: i64,
}

#[derive(Debug, Serialize)]
struct UpdateResponse {
    state: LiveState,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    id: i64,
    timestamp: String,
    old_value: LiveState,
    new_value: LiveState,
}

impl From<MutationRecord> for LogEntry {
    fn from(record: MutationRecord) -> Self {
        Self {
            id: record.id,
            timestamp: format_timestamp(record.timestamp),
            old_value: record.previous_state,
            new_value: record.resulting_state,
        }
    }
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<LogEntry>,
    page: i64,
    limit: i64,
    total: u64,
}

pub fn build_router(
    config: &Config,
    controller: StateController,
    audit_log: Arc<AuditLog>,
) -> Router {
    let auth_state = ApiKeyAuthState {
        api_key: config.api_key(),
    };
    let body_limit = usize::try_from(config.max_update_body_bytes).unwrap_or(usize::MAX);
    let app_state = AppState {
        controller,
        audit_log,
    };

    let protected = Router::new()
        .route(
            "/update",
            post(update_state).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, api_key_auth));

    Router::new()
        .route("/status", get(get_status))
        .route("/logs", get(list_logs))
        .merge(protected)
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

#[derive(Clone)]
struct ApiKeyAuthState {
    api_key: Option<ApiKey>,
}

async fn api_key_auth(
    State(auth): State<ApiKeyAuthState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = auth.api_key.as_ref() else {
        return next.run(req).await;
    };

    let Some(presented) = extract_api_key(req.headers()) else {
        debug!("rejecting update: missing api key");
        return ApiError::unauthorized("API key is required. Please provide X-API-KEY header.")
            .into_response();
    };

    if verify_api_key(&presented, expected) {
        return next.run(req).await;
    }

    debug!("rejecting update: invalid api key");
    ApiError::unauthorized("Invalid API key.").into_response()
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::HeaderName::from_static(API_KEY_HEADER))?;
    raw.to_str().ok().map(|s| s.to_string())
}

async fn get_status(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let snap = state.controller.read().await;
    let now = Utc::now();
    let uptime_seconds = (now - snap.started_at).num_seconds().max(0);
    Json(StatusResponse {
        state: snap.state,
        timestamp: now.to_rfc3339(),
        uptime_seconds,
    })
}

async fn update_state(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<MutationRequest>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let next = state.controller.apply(req).await?;
    Ok(Json(UpdateResponse { state: next }))
}

async fn list_logs(
    Extension(state): Extension<AppState>,
    ApiQuery(query): ApiQuery<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let page = query.page.unwrap_or(DEFAULT_PAGE);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);

    let audit_log = state.audit_log.clone();
    let result = tokio::task::spawn_blocking(move || audit_log.page(page, limit))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;

    Ok(Json(LogsResponse {
        logs: result.records.into_iter().map(LogEntry::from).collect(),
        page,
        limit,
        total: result.total,
    }))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

/// Serves `app` until `shutdown` resolves. Fails if the state controller's
/// writer task exits first, since every later update would be refused.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    writer: JoinHandle<()>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .into_future();

    tokio::select! {
        res = server => {
            res?;
            Ok(())
        }
        res = writer => {
            error!(result = ?res, "state controller writer task exited");
            anyhow::bail!("state controller writer task exited: {res:?}")
        }
    }
}
