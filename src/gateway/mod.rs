//! Axum-based HTTP gateway for mobile devices and remote stations.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (30s)
//! - Every failure is a JSON [`Failure`] with a matching status code

use crate::auth::{AccountStore, Identity, Pbkdf2Verifier, User};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::ledger::{RewardLedger, Submission};
use crate::pairing::{
    BindingCoordinator, IssuedToken, RegistrySettings, SessionPoll, SessionStatus,
    SqliteSessionRegistry, SvgQrEncoder, Teardown,
};
use crate::store::Store;
use crate::{ErrorKind, Failure, StationError};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BindingCoordinator>,
    pub ledger: Arc<RewardLedger>,
}

impl AppState {
    pub fn from_config(config: &Config, store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        let settings = RegistrySettings::new(config.session_ttl(), config.session.qr_prefix.clone());
        let registry = Arc::new(SqliteSessionRegistry::new(
            store.clone(),
            clock.clone(),
            settings,
        ));
        let accounts = Arc::new(AccountStore::new(
            store.clone(),
            Arc::new(Pbkdf2Verifier::new(config.credentials.iterations)),
            clock.clone(),
        ));
        // Remote stations keep their own cache; the gateway never reuses tokens.
        let coordinator = BindingCoordinator::new(registry, accounts, Arc::new(SvgQrEncoder::default()));
        Self {
            coordinator: Arc::new(coordinator),
            ledger: Arc::new(RewardLedger::new(store, clock)),
        }
    }

    fn accounts(&self) -> &AccountStore {
        self.coordinator.accounts()
    }
}

/// Build the router with body limit and timeout layers applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/sessions", post(handle_create_session))
        .route(
            "/api/sessions/{token}",
            get(handle_poll_session).delete(handle_end_session),
        )
        .route("/api/sessions/{token}/scan", post(handle_scan_session))
        .route("/api/sessions/{token}/bind", post(handle_bind_session))
        .route("/api/users", post(handle_register_user))
        .route("/api/users/{id}/submissions", get(handle_list_submissions))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Open the configured database and serve until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let db_path = config.db_path()?;
    let store = Arc::new(Store::open(&db_path)?);
    let state = AppState::from_config(&config, store, Arc::new(SystemClock));

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid gateway address {}:{}",
                config.gateway.host, config.gateway.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, db = %db_path.display(), "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ══════════════════════════════════════════════════════════════════════════════

/// A [`Failure`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    failure: Failure,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            failure: Failure {
                kind: ErrorKind::InvalidInput,
                message: message.into(),
            },
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Expired => StatusCode::GONE,
        ErrorKind::AlreadyUsed | ErrorKind::AlreadyBound | ErrorKind::EmailTaken => {
            StatusCode::CONFLICT
        }
        ErrorKind::InvalidCredentials | ErrorKind::NotAuthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::InvalidMaterial
        | ErrorKind::InvalidWeight
        | ErrorKind::InvalidInput
        | ErrorKind::NoActiveSession => StatusCode::BAD_REQUEST,
        ErrorKind::QrError | ErrorKind::StorageError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StationError> for ApiError {
    fn from(err: StationError) -> Self {
        let status = status_for(err.kind());
        if status.is_server_error() {
            tracing::error!(kind = err.kind().as_str(), "Request failed: {err}");
        }
        Self {
            status,
            failure: err.to_failure(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("Invalid request: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.failure)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct BindBody {
    pub email: String,
    #[serde(alias = "password")]
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub name: String,
    pub email: String,
    #[serde(alias = "password")]
    pub secret: String,
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/sessions: issue a token and its QR image.
async fn handle_create_session(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<IssuedToken>)> {
    let issued = state.coordinator.request_token()?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// Terminal poll result: the failure plus the session status.
#[derive(Debug, Serialize)]
struct ExpiredPoll {
    status: SessionStatus,
    #[serde(flatten)]
    failure: Failure,
}

/// GET /api/sessions/{token}: station poll. 410 once expired.
async fn handle_poll_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    match state.coordinator.poll_status(&token) {
        Ok(poll) => Json(poll).into_response(),
        Err(err @ StationError::Expired) => {
            let body = ExpiredPoll {
                status: SessionStatus::Expired,
                failure: err.to_failure(),
            };
            (status_for(err.kind()), Json(body)).into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

/// POST /api/sessions/{token}/scan: mobile reports it read the code.
async fn handle_scan_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<SessionPoll>> {
    let session = state.coordinator.scan(&token)?;
    Ok(Json(SessionPoll {
        status: session.status,
        identity: None,
    }))
}

/// POST /api/sessions/{token}/bind: mobile submits credentials.
async fn handle_bind_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: std::result::Result<Json<BindBody>, JsonRejection>,
) -> ApiResult<Json<Identity>> {
    let Json(body) = body?;
    let identity = state
        .coordinator
        .authenticate_and_bind(&token, &body.email, &body.secret)?;
    Ok(Json(identity))
}

/// DELETE /api/sessions/{token}: best-effort teardown.
async fn handle_end_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Json<Teardown> {
    Json(state.coordinator.end_session(&token))
}

/// POST /api/users
async fn handle_register_user(
    State(state): State<AppState>,
    body: std::result::Result<Json<RegisterBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let Json(body) = body?;
    let user = state
        .accounts()
        .register(&body.name, &body.email, &body.secret)?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// `Authorization: Basic base64(email:secret)`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (email, secret) = text.split_once(':')?;
    Some((email.to_string(), secret.to_string()))
}

/// GET /api/users/{id}/submissions: newest first. Only the user themselves,
/// proven with Basic credentials, may read the history.
async fn handle_list_submissions(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Submission>>> {
    let (email, secret) = basic_credentials(&headers).ok_or(StationError::NotAuthenticated)?;
    let user = state.accounts().authenticate(&email, &secret)?;
    if user.id != user_id {
        tracing::warn!(caller = user.id, target = user_id, "Refused foreign submission history");
        return Err(StationError::NotAuthenticated.into());
    }
    Ok(Json(state.ledger.list_submissions(user_id)?))
}
