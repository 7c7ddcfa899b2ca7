use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as HttpRouter};
use chrono::{DateTime, Utc};
use http_body_util::LengthLimitError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::BrokerError;
use crate::port_allocator::PortAllocator;
use crate::protocol::HttpRequestFrame;
use crate::registry::{ClientKind, ClientRecord, Registration, Registry};
use crate::router::{new_request_id, Router};

/// プロキシするリクエストボディの上限
pub const MAX_BODY_SIZE: usize = 256 * 1024;

/// ハンドラが共有する状態
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
    pub dispatcher: Arc<Dispatcher>,
    pub ports: Arc<PortAllocator>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub request_id: String,
    pub client_id: String,
    pub port: u16,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct DispatcherStatus {
    pub workers: usize,
    pub queue_size: usize,
    pub running: usize,
    pub queued: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub server_status: &'static str,
    pub total_clients: usize,
    pub tunnels_connected: usize,
    pub timestamp: DateTime<Utc>,
    pub registered_clients: Vec<ClientRecord>,
    pub dispatcher: DispatcherStatus,
    pub ports: Vec<u16>,
    pub max_ports: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match &self {
            BrokerError::Validation(_) => "VALIDATION_ERROR",
            BrokerError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            BrokerError::PortExhausted { .. } => "PORT_EXHAUSTED",
            BrokerError::PortUnavailable { .. } => "PORT_UNAVAILABLE",
            BrokerError::NotFound(_) => "NOT_FOUND",
            BrokerError::Rejected(_) => "REJECTED",
            BrokerError::Timeout(_) => "TIMEOUT",
            BrokerError::Cancelled => "CANCELLED",
            BrokerError::Connection(_) => "CONNECTION_ERROR",
            BrokerError::Io(_) => "INTERNAL_ERROR",
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: Some(code.to_string()),
            }),
        )
            .into_response()
    }
}

/// HTTP フロントのルーター
///
/// 管理用のエンドポイント以外はすべてクライアントにプロキシする。
pub fn build_router(state: AppState) -> HttpRouter {
    HttpRouter::new()
        .route("/register", post(register))
        .route("/status", get(status))
        .route("/clients", get(list_clients))
        .route("/health", get(health))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `POST /register`
async fn register(State(state): State<AppState>, body: Bytes) -> Result<Response, BrokerError> {
    let req: RegisterRequest = serde_json::from_slice(&body)
        .map_err(|e| BrokerError::validation(format!("invalid request body: {}", e)))?;

    let kind = match req.protocol.as_deref() {
        None => ClientKind::Http,
        Some(p) => p.parse::<ClientKind>()?,
    };

    let record = state
        .registry
        .register_client(Registration {
            client_id: req.client_id,
            paths: req.paths,
            kind,
            metadata: req.metadata,
        })
        .await?;

    info!(
        client_id = %record.id,
        port = record.tcp_port,
        "Registration accepted"
    );
    let resp = RegisterResponse {
        request_id: new_request_id(),
        client_id: record.id,
        port: record.tcp_port,
        status: "success".to_string(),
    };
    Ok((StatusCode::CREATED, Json(resp)).into_response())
}

/// `GET /status`
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let registered_clients = state.registry.list_clients().await;
    Json(StatusResponse {
        server_status: "running",
        total_clients: registered_clients.len(),
        tunnels_connected: state.router.session_count().await,
        timestamp: Utc::now(),
        registered_clients,
        dispatcher: DispatcherStatus {
            workers: state.dispatcher.workers(),
            queue_size: state.dispatcher.queue_size(),
            running: state.dispatcher.running(),
            queued: state.dispatcher.queued(),
        },
        ports: state.ports.listening_ports().await,
        max_ports: state.ports.max_ports(),
    })
}

/// `GET /clients`
async fn list_clients(State(state): State<AppState>) -> Json<Vec<ClientRecord>> {
    Json(state.registry.list_clients().await)
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "time": Utc::now(),
    }))
}

/// 登録されたパスへのリクエストをクライアントに転送
async fn proxy(State(state): State<AppState>, request: Request) -> Result<Response, BrokerError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(read_body_error)?;

    let frame = HttpRequestFrame {
        request_id: new_request_id(),
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: flatten_headers(&parts.headers),
        body,
    };
    let path = frame.path.clone();
    debug!(request_id = %frame.request_id, "Proxying {} {}", frame.method, path);

    let resp = state.router.clone().route_http(frame).await.map_err(|e| {
        match &e {
            BrokerError::NotFound(_) => debug!("No client for {}", path),
            _ => warn!("Failed to proxy {}: {}", path, e),
        }
        e
    })?;

    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = status;
    for (name, value) in &resp.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        if is_hop_by_hop(&name) {
            continue;
        }
        response.headers_mut().insert(name, value);
    }
    Ok(response)
}

fn read_body_error(err: axum::Error) -> BrokerError {
    let inner = err.into_inner();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(inner.as_ref());
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return BrokerError::PayloadTooLarge {
                limit: MAX_BODY_SIZE,
            };
        }
        source = e.source();
    }
    BrokerError::validation(format!("failed to read request body: {}", inner))
}

/// 同名ヘッダーは `, ` で連結する
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::CONTENT_LENGTH
        || *name == header::UPGRADE
        || name.as_str() == "keep-alive"
}
