use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::completion::{self, SseFrames};
use super::config::AppConfig;
use super::error::GatewayError;
use super::openai::{model_json, models_list_json, ChatCompletionRequest};
use super::pool::SessionPool;
use super::secrets::api_key_matches;
use super::time::{unix_ms, unix_secs};

#[derive(Clone)]
pub struct GatewayState {
    pub cfg: Arc<AppConfig>,
    pub pool: SessionPool,
    pub started_at_unix_ms: u64,
    pub last_activity_unix_ms: Arc<AtomicU64>,
    pub requests_total: Arc<AtomicU64>,
}

impl GatewayState {
    pub fn new(cfg: Arc<AppConfig>, pool: SessionPool) -> Self {
        Self {
            cfg,
            pool,
            started_at_unix_ms: unix_ms(),
            last_activity_unix_ms: Arc::new(AtomicU64::new(0)),
            requests_total: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        self.last_activity_unix_ms.store(unix_ms(), Ordering::Relaxed);
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/v1/models", get(models))
        .route("/v1/models/:model_id", get(model))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

pub async fn bind_listener(cfg: &AppConfig) -> anyhow::Result<tokio::net::TcpListener> {
    let addr: SocketAddr = format!("{}:{}", cfg.listen.host, cfg.listen.port).parse()?;
    Ok(tokio::net::TcpListener::bind(addr).await?)
}

/// Serves until `shutdown` resolves, then lets in-flight requests finish.
pub async fn serve<F>(
    state: GatewayState,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn require_api_key(st: &GatewayState, headers: &HeaderMap) -> Option<Response> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if api_key_matches(auth, &st.cfg.api_key) {
        return None;
    }
    let message = if auth.is_none() {
        "missing Authorization header"
    } else {
        "invalid API key"
    };
    Some(
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {
                "message": message,
                "type": "invalid_api_key",
                "code": 401
            }})),
        )
            .into_response(),
    )
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "h2oGPTe OpenAI-compatible gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/v1/models", "/v1/chat/completions"]
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

async fn status(State(st): State<GatewayState>, headers: HeaderMap) -> Response {
    if let Some(resp) = require_api_key(&st, &headers) {
        return resp;
    }
    let credential = st
        .pool
        .gateway()
        .credentials()
        .snapshot()
        .map(|c| c.to_status_json());
    let acquisitions = st.pool.gateway().credentials().acquisitions();
    Json(json!({
        "listen": { "host": st.cfg.listen.host, "port": st.cfg.listen.port },
        "backend": st.cfg.backend.base_url,
        "identity": st.cfg.identity.kind.as_str(),
        "api_key": if st.cfg.api_key.trim().is_empty() { "unset" } else { "set" },
        "credential": credential,
        "credential_acquisitions": acquisitions,
        "pool": st.pool.stats(),
        "started_at_unix_ms": st.started_at_unix_ms,
        "last_activity_unix_ms": st.last_activity_unix_ms.load(Ordering::Relaxed),
        "requests_total": st.requests_total.load(Ordering::Relaxed),
    }))
    .into_response()
}

async fn models(State(st): State<GatewayState>, headers: HeaderMap) -> Response {
    if let Some(resp) = require_api_key(&st, &headers) {
        return resp;
    }
    Json(models_list_json(&st.cfg.backend.models, unix_secs())).into_response()
}

async fn model(
    State(st): State<GatewayState>,
    Path(model_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(resp) = require_api_key(&st, &headers) {
        return resp;
    }
    Json(model_json(&model_id, unix_secs())).into_response()
}

async fn chat_completions(
    State(st): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    if let Some(resp) = require_api_key(&st, &headers) {
        return resp;
    }
    st.touch();

    let body = match body {
        Ok(Json(v)) => v,
        Err(rejection) => {
            return GatewayError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    let req: ChatCompletionRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return GatewayError::InvalidRequest(format!("invalid chat completion request: {e}"))
                .into_response();
        }
    };

    if req.wants_stream() {
        match completion::stream(st.pool.clone(), &req).await {
            Ok(frames) => sse_response(frames),
            Err(e) => {
                log::warn!("chat completion (stream) failed: {e}");
                e.into_response()
            }
        }
    } else {
        match completion::complete(&st.pool, &req).await {
            Ok(v) => (StatusCode::OK, Json(v)).into_response(),
            Err(e) => {
                log::warn!("chat completion failed: {e}");
                e.into_response()
            }
        }
    }
}

fn sse_response(frames: SseFrames) -> Response {
    let body = Body::from_stream(frames.map(|f| Ok::<_, Infallible>(Bytes::from(f))));

    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    resp
}
