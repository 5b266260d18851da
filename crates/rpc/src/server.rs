use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use rehost_core::{load_declared_state, RehostError, Rehoster};
use rehost_types::{Identifier, KeyInfo};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::prometheus::render_prometheus;

pub struct AppState {
    pub rehoster: Arc<Rehoster>,
    /// Declared-state document applied by `POST /sync`.
    pub keys_path: Option<PathBuf>,
    pub detailed_metrics: bool,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(rehoster: Arc<Rehoster>) -> Self {
        Self {
            rehoster,
            keys_path: None,
            detailed_metrics: false,
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, Default, Deserialize)]
struct PutKeyRequest {
    #[serde(default)]
    info: Option<String>,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    info: String,
    details: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    keys: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<RehostError> for ApiError {
    fn from(err: RehostError) -> Self {
        if err.is_client_error() {
            Self::bad_request(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn start_server<F>(state: AppState, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = bind_listener(addr).await?;
    serve(listener, state, shutdown).await
}

pub async fn serve<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(address) = listener.local_addr() {
        info!("Rehoster listening on {} on port {}", address.ip(), address.port());
    }
    let app = build_router(Arc::new(state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server terminated unexpectedly")
}

pub async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(handle_list_keys))
        .route("/info", get(handle_info))
        .route("/sync", post(handle_sync))
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .route("/:key", put(handle_put_key).delete(handle_delete_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_key(key: &str) -> Result<Identifier, ApiError> {
    Identifier::from_hex(key).map_err(|err| {
        info!("Bad request for key {}: {}", key, err);
        ApiError::from(RehostError::from(err))
    })
}

async fn handle_put_key(
    State(state): State<SharedState>,
    AxumPath(key): AxumPath<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let identifier = parse_key(&key)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        PutKeyRequest::default()
    } else {
        serde_json::from_slice::<PutKeyRequest>(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?
    };

    state.rehoster.add(identifier, request.info).await?;
    Ok(StatusCode::OK)
}

async fn handle_delete_key(
    State(state): State<SharedState>,
    AxumPath(key): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    let identifier = parse_key(&key)?;
    state.rehoster.remove(identifier).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list_keys(State(state): State<SharedState>) -> Json<Vec<KeyInfo>> {
    Json(state.rehoster.list().iter().map(KeyInfo::from).collect())
}

async fn handle_info(State(state): State<SharedState>) -> Json<InfoResponse> {
    let inventory = state.rehoster.inventory().await;
    Json(InfoResponse {
        info: inventory.summary(),
        details: inventory.details(state.rehoster.links()),
    })
}

async fn handle_sync(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let Some(path) = state.keys_path.as_ref() else {
        return Err(ApiError::bad_request(
            "No config path was specified during server startup",
        ));
    };

    let desired = load_declared_state(path).await.map_err(|err| {
        warn!("Could not load declared state from {}: {}", path.display(), err);
        ApiError::bad_request(format!(
            "Could not apply the config at {}: {}",
            path.display(),
            config_reason(&err)
        ))
    })?;

    let outcome = state.rehoster.reconcile(&desired).await?;
    let status = if outcome.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    debug!("Sync from {} finished with {}", path.display(), status);
    Ok((status, Json(outcome)).into_response())
}

fn config_reason(err: &RehostError) -> String {
    match err {
        RehostError::ConfigUnreadable { source, .. } => source.to_string(),
        RehostError::ConfigMalformed { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

async fn handle_metrics(State(state): State<SharedState>) -> Response {
    let inventory = state.rehoster.inventory().await;
    let body = render_prometheus(&inventory, state.detailed_metrics);

    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_seconds(),
        keys: state.rehoster.registry().len(),
    })
}
