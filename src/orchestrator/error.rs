use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// Raw classification of what the backend did. Only the gateway and the
/// credential store see these; callers get a [`GatewayError`].
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),

    #[error("backend rate limited the request: {0}")]
    RateLimited(String),

    #[error("backend rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("backend server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected backend response: {0}")]
    Protocol(String),

    #[error("backend chat error: {0}")]
    ChatFailed(String),

    #[error("backend stream idle for {0}s")]
    IdleTimeout(u64),
}

impl UpstreamError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, UpstreamError::Unauthorized(_))
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate_for_log(body, 300);
        match status {
            401 => UpstreamError::Unauthorized(message),
            403 if mentions_auth(body) => UpstreamError::Unauthorized(message),
            429 => UpstreamError::RateLimited(message),
            400..=499 => UpstreamError::Rejected { status, message },
            _ => UpstreamError::Server { status, message },
        }
    }

    /// Chat error frames carry free text; expired sessions and stale CSRF tokens show up there
    /// rather than as a status code.
    pub fn from_chat_error(message: &str) -> Self {
        if mentions_auth(message) {
            UpstreamError::Unauthorized(truncate_for_log(message, 300))
        } else {
            UpstreamError::ChatFailed(truncate_for_log(message, 300))
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        UpstreamError::Transport(e.to_string())
    }
}

fn mentions_auth(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    [
        "unauthorized",
        "unauthenticated",
        "not authenticated",
        "csrf",
        "session expired",
        "invalid session",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

pub fn truncate_for_log(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let mut out: String = s.chars().take(limit).collect();
    out.push('…');
    out
}

/// What a caller of the gateway can observe. Rendered as an OpenAI error object.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no usable backend credential: {0}")]
    CredentialUnavailable(String),

    #[error("backend authentication failed after refresh: {0}")]
    BackendAuthFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend rate limit reached: {0}")]
    RateLimited(String),

    #[error("backend rejected the request: {0}")]
    BackendRejected(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("{0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::CredentialUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendAuthFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackendRejected(_) => StatusCode::BAD_GATEWAY,
            GatewayError::StreamInterrupted(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::CredentialUnavailable(_) => "upstream_credentials_unavailable",
            GatewayError::BackendAuthFailed(_) => "upstream_auth_error",
            GatewayError::BackendUnavailable(_) => "upstream_unavailable",
            GatewayError::RateLimited(_) => "rate_limit_error",
            GatewayError::BackendRejected(_) => "upstream_rejected",
            GatewayError::StreamInterrupted(_) => "stream_interrupted",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
        }
    }

    /// OpenAI-shaped error body. Messages are built from our own classification, so no
    /// session ids or tokens end up here.
    pub fn to_openai_json(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.status().as_u16(),
            }
        })
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Unauthorized(m) => GatewayError::BackendAuthFailed(m),
            UpstreamError::RateLimited(m) => GatewayError::RateLimited(m),
            UpstreamError::Rejected { status, message } => {
                GatewayError::BackendRejected(format!("status {status}: {message}"))
            }
            UpstreamError::Server { status, message } => {
                GatewayError::BackendUnavailable(format!("status {status}: {message}"))
            }
            UpstreamError::Transport(m) | UpstreamError::Protocol(m) => {
                GatewayError::BackendUnavailable(m)
            }
            UpstreamError::ChatFailed(m) => GatewayError::BackendUnavailable(m),
            e @ UpstreamError::IdleTimeout(_) => GatewayError::StreamInterrupted(e.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_openai_json())).into_response()
    }
}
