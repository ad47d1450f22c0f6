//! In-process stand-in for the chat backend: `/chats`, `/rpc/db` and the `/ws` chat socket,
//! with call counters and knobs for the failure modes the gateway has to survive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Json, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::backend::BackendGateway;
use super::config::{AppConfig, IdentityKind, PoolConfig};
use super::credentials::CredentialStore;
use super::pool::SessionPool;
use super::upstream::UpstreamClient;
use crate::constants::{CSRF_HEADER_NAME, SESSION_COOKIE_NAME};

pub const CONFIGURED_SESSION: &str = "configured-session-0001";
pub const CONFIGURED_CSRF: &str = "configured-csrf-0001";
pub const PARTIALS: [&str; 3] = ["Hel", "lo, ", "world"];

struct SessionEntry {
    csrf: String,
    expired: bool,
}

#[derive(Default)]
struct MockState {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    chats: Mutex<HashSet<String>>,
    ids: AtomicU64,
    page_calls: AtomicUsize,
    provision_calls: AtomicUsize,
    renewal_calls: AtomicUsize,
    create_calls: AtomicUsize,
    chat_calls: AtomicUsize,
    page_delay_ms: AtomicU64,
    pages_broken: AtomicBool,
    chat_auth_failures: AtomicUsize,
    chat_status: Mutex<Option<u16>>,
    fail_after_partials: Mutex<Option<usize>>,
    fail_with_auth_error: AtomicBool,
    partial_delay_ms: AtomicU64,
    last_query: Mutex<Option<Value>>,
}

impl MockState {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn issue_session(&self) -> (String, String) {
        let token = format!("guest-session-{:04}", self.next_id());
        let csrf = format!("csrf-{:04}", self.next_id());
        self.sessions.lock().insert(
            token.clone(),
            SessionEntry {
                csrf: csrf.clone(),
                expired: false,
            },
        );
        (token, csrf)
    }

    fn is_live(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .get(token)
            .map(|e| !e.expired)
            .unwrap_or(false)
    }
}

fn cookie_session(headers: &HeaderMap) -> Option<String> {
    let prefix = format!("{SESSION_COOKIE_NAME}=");
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|c| c.trim().strip_prefix(prefix.as_str()).map(|v| v.to_string()))
}

fn set_cookie(token: &str) -> (header::HeaderName, String) {
    (
        header::SET_COOKIE,
        format!("{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly"),
    )
}

async fn chats_page(
    State(st): State<Arc<MockState>>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let cookie = cookie_session(&headers);
    // Second hop of guest provisioning; not a handshake of its own.
    let guest_hop = q.contains_key("guest");
    if !guest_hop {
        st.page_calls.fetch_add(1, Ordering::SeqCst);
        if cookie.is_some() {
            st.renewal_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            st.provision_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
    let delay = st.page_delay_ms.load(Ordering::Relaxed);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if st.pages_broken.load(Ordering::Relaxed) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "page renderer down").into_response();
    }

    let Some(cookie) = cookie else {
        let (token, _) = st.issue_session();
        return (
            StatusCode::FOUND,
            [
                (header::LOCATION, "/chats?guest=1".to_string()),
                set_cookie(&token),
            ],
        )
            .into_response();
    };

    let (token, rotated) = if st.is_live(&cookie) {
        (cookie, false)
    } else {
        (st.issue_session().0, true)
    };
    let csrf = format!("csrf-{:04}", st.next_id());
    if let Some(entry) = st.sessions.lock().get_mut(&token) {
        entry.csrf = csrf.clone();
    }
    let user = st.next_id();
    let conf = json!({
        "csrf_token": csrf,
        "user_id": format!("user-{user:04}"),
        "username": format!("Guest {user}"),
    });
    let html = Html(format!(
        "<html><body><div id=\"root\" data-conf='{conf}'></div></body></html>"
    ));
    if rotated {
        ([set_cookie(&token)], html).into_response()
    } else {
        html.into_response()
    }
}

async fn rpc_db(
    State(st): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    st.create_calls.fetch_add(1, Ordering::SeqCst);
    let Some(token) = cookie_session(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    let csrf = headers
        .get(CSRF_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    {
        let sessions = st.sessions.lock();
        match sessions.get(&token) {
            Some(e) if !e.expired => {
                if e.csrf != csrf {
                    return (StatusCode::FORBIDDEN, "CSRF token missing or incorrect")
                        .into_response();
                }
            }
            _ => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        }
    }
    if body.get(0).and_then(|v| v.as_str()) != Some("create_chat_session") {
        return (StatusCode::BAD_REQUEST, "unknown rpc").into_response();
    }
    let id = format!("chat-{:04}", st.next_id());
    st.chats.lock().insert(id.clone());
    Json(json!({"id": id})).into_response()
}

async fn chat_socket(
    State(st): State<Arc<MockState>>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    st.chat_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(code) = *st.chat_status.lock() {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "rejected by test").into_response();
    }
    let csrf = headers
        .get(CSRF_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected_csrf = cookie_session(&headers).and_then(|t| {
        st.sessions
            .lock()
            .get(&t)
            .filter(|e| !e.expired)
            .map(|e| e.csrf.clone())
    });
    match expected_csrf {
        None => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        Some(expected) if expected != csrf => {
            return (StatusCode::FORBIDDEN, "CSRF token missing or incorrect").into_response();
        }
        Some(_) => {}
    }
    let known = q
        .get("currentSessionID")
        .map(|id| st.chats.lock().contains(id))
        .unwrap_or(false);
    if !known {
        return (StatusCode::NOT_FOUND, "no such chat session").into_response();
    }
    ws.on_upgrade(move |socket| run_chat(socket, st))
}

async fn send_frame(socket: &mut WebSocket, frame: Value) -> bool {
    socket.send(Message::Text(frame.to_string())).await.is_ok()
}

async fn run_chat(mut socket: WebSocket, st: Arc<MockState>) {
    let Some(Ok(Message::Text(txt))) = socket.recv().await else {
        return;
    };
    *st.last_query.lock() = serde_json::from_str(&txt).ok();

    if !send_frame(&mut socket, json!({"t": "cx", "id": "ctx"})).await {
        return;
    }
    let fail_auth = st
        .chat_auth_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            usize::MAX => Some(n),
            n => Some(n - 1),
        })
        .is_ok();
    if fail_auth {
        send_frame(
            &mut socket,
            json!({"t": "ce", "error": "Unauthorized: session expired"}),
        )
        .await;
        return;
    }

    let fail_after = *st.fail_after_partials.lock();
    let delay = st.partial_delay_ms.load(Ordering::Relaxed);
    for (i, part) in PARTIALS.iter().enumerate() {
        if fail_after == Some(i) {
            let error = if st.fail_with_auth_error.load(Ordering::SeqCst) {
                "Unauthorized: session expired"
            } else {
                "model crashed"
            };
            send_frame(&mut socket, json!({"t": "ce", "error": error})).await;
            return;
        }
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !send_frame(&mut socket, json!({"t": "cp", "body": part})).await {
            return;
        }
    }
    send_frame(&mut socket, json!({"t": "cr", "body": PARTIALS.concat()})).await;
    send_frame(&mut socket, json!({"t": "ca", "usage_stats": {}})).await;
}

pub struct MockBackend {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        state.sessions.lock().insert(
            CONFIGURED_SESSION.to_string(),
            SessionEntry {
                csrf: CONFIGURED_CSRF.to_string(),
                expired: false,
            },
        );
        let app = Router::new()
            .route("/chats", get(chats_page))
            .route("/rpc/db", post(rpc_db))
            .route("/ws", get(chat_socket))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{}:{}", addr.ip(), addr.port()),
            state,
        }
    }

    pub fn page_calls(&self) -> usize {
        self.state.page_calls.load(Ordering::SeqCst)
    }

    pub fn provision_calls(&self) -> usize {
        self.state.provision_calls.load(Ordering::SeqCst)
    }

    pub fn renewal_calls(&self) -> usize {
        self.state.renewal_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.state.chat_calls.load(Ordering::SeqCst)
    }

    pub fn partial_count(&self) -> usize {
        PARTIALS.len()
    }

    pub fn last_query(&self) -> Option<Value> {
        self.state.last_query.lock().clone()
    }

    pub fn is_valid_session(&self, token: &str) -> bool {
        self.state.is_live(token)
    }

    pub fn expire_session(&self, token: &str) {
        if let Some(e) = self.state.sessions.lock().get_mut(token) {
            e.expired = true;
        }
    }

    pub fn rotate_csrf_tokens(&self) {
        for e in self.state.sessions.lock().values_mut() {
            e.csrf = format!("{}-rotated", e.csrf);
        }
    }

    pub fn set_page_delay_ms(&self, ms: u64) {
        self.state.page_delay_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_pages_broken(&self, broken: bool) {
        self.state.pages_broken.store(broken, Ordering::Relaxed);
    }

    /// The next `n` chats answer with an auth error frame. `usize::MAX` means every chat.
    pub fn set_chat_auth_failures(&self, n: usize) {
        self.state.chat_auth_failures.store(n, Ordering::SeqCst);
    }

    /// Rejects the chat socket handshake with this HTTP status.
    pub fn set_chat_status(&self, status: Option<u16>) {
        *self.state.chat_status.lock() = status;
    }

    pub fn set_fail_after_partials(&self, n: Option<usize>) {
        self.state.fail_with_auth_error.store(false, Ordering::SeqCst);
        *self.state.fail_after_partials.lock() = n;
    }

    /// Like [`set_fail_after_partials`](Self::set_fail_after_partials), but the error frame
    /// says the session expired.
    pub fn set_auth_failure_after_partials(&self, n: usize) {
        self.state.fail_with_auth_error.store(true, Ordering::SeqCst);
        *self.state.fail_after_partials.lock() = Some(n);
    }

    pub fn set_partial_delay_ms(&self, ms: u64) {
        self.state.partial_delay_ms.store(ms, Ordering::Relaxed);
    }
}

pub fn test_config(base_url: &str, kind: IdentityKind) -> AppConfig {
    let mut cfg = AppConfig::default_config();
    cfg.listen.host = "127.0.0.1".to_string();
    cfg.listen.port = 0;
    cfg.backend.base_url = base_url.to_string();
    cfg.backend.request_timeout_seconds = 5;
    cfg.backend.stream_idle_timeout_seconds = 5;
    cfg.identity.kind = kind;
    cfg.identity.session = CONFIGURED_SESSION.to_string();
    cfg.identity.csrf_token = CONFIGURED_CSRF.to_string();
    cfg.pool = PoolConfig {
        target_size: 1,
        checkout_timeout_ms: 100,
        maintain_interval_ms: 50,
        backoff_base_ms: 50,
        backoff_max_ms: 500,
    };
    cfg
}

/// A pool wired to `cfg.backend`, maintenance not started.
pub fn test_pool(cfg: &AppConfig) -> SessionPool {
    let upstream = UpstreamClient::new(&cfg.backend).expect("upstream client");
    let credentials = Arc::new(CredentialStore::new(cfg, upstream.clone()));
    let gateway = Arc::new(BackendGateway::new(credentials, upstream));
    SessionPool::new(cfg.pool.clone(), gateway)
}
