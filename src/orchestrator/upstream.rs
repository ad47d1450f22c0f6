use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, LOCATION, ORIGIN, SET_COOKIE,
    USER_AGENT,
};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use super::config::BackendConfig;
use super::credentials::Credential;
use super::error::{truncate_for_log, UpstreamError};
use crate::constants::{BROWSER_USER_AGENT, CSRF_HEADER_NAME, SESSION_COOKIE_NAME};

/// Raw text chunks of one backend answer, in the order the backend sent them.
pub type ChatChunks = BoxStream<'static, Result<String, UpstreamError>>;

const MAX_REDIRECTS: usize = 10;

/// The backend's request shape: one message body plus an optional system prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendQuery {
    pub body: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

/// What the `/chats` page tells us about the browser identity behind a cookie.
#[derive(Debug, Clone)]
pub struct ChatPage {
    /// Set when the backend issued (or rotated) the session cookie.
    pub session_token: Option<String>,
    pub csrf_token: String,
    pub username: String,
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BackendFrame {
    Context,
    Partial(String),
    Full(String),
    Done,
    Error(String),
    Other,
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    ws_base_url: String,
    llm: String,
    include_chat_history: String,
    request_timeout: Duration,
    idle_timeout_seconds: u64,
}

fn ws_base_for(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

fn session_cookie_from_headers(headers: &HeaderMap) -> Option<String> {
    let prefix = format!("{SESSION_COOKIE_NAME}=");
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.trim().strip_prefix(prefix.as_str()))
        .map(|rest| rest.split(';').next().unwrap_or("").trim().to_string())
        .find(|v| !v.is_empty())
}

/// The chats page embeds its client config as `data-conf='{...}'`.
pub(crate) fn extract_data_conf(html: &str) -> Option<Value> {
    let marker = "data-conf='";
    let start = html.find(marker)? + marker.len();
    let len = html[start..].find('\'')?;
    serde_json::from_str(&html[start..start + len]).ok()
}

pub(crate) fn parse_frame(text: &str) -> BackendFrame {
    let Ok(v) = serde_json::from_str::<Value>(text) else {
        log::debug!("ignoring non-json backend frame");
        return BackendFrame::Other;
    };
    let body = || {
        v.get("body")
            .and_then(|b| b.as_str())
            .unwrap_or("")
            .to_string()
    };
    match v.get("t").and_then(|t| t.as_str()).unwrap_or("") {
        "cx" => BackendFrame::Context,
        "cp" => BackendFrame::Partial(body()),
        "cr" => BackendFrame::Full(body()),
        "ca" | "cd" => BackendFrame::Done,
        "ce" => {
            let msg = match v.get("error").or_else(|| v.get("body")) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "unknown error".to_string(),
                Some(other) => other.to_string(),
            };
            BackendFrame::Error(msg)
        }
        _ => BackendFrame::Other,
    }
}

fn header_value(v: &str) -> Result<HeaderValue, UpstreamError> {
    HeaderValue::from_str(v).map_err(|_| {
        UpstreamError::Protocol("credential contains characters not allowed in headers".into())
    })
}

impl UpstreamClient {
    pub fn new(cfg: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            // Avoid hanging forever on broken upstream TCP handshakes.
            .connect_timeout(Duration::from_secs(10))
            // Redirects are walked by hand so every Set-Cookie along the way is seen.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            ws_base_url: ws_base_for(&base_url),
            base_url,
            llm: cfg.llm.clone(),
            include_chat_history: cfg.include_chat_history.clone(),
            request_timeout: Duration::from_secs(cfg.request_timeout_seconds.max(1)),
            idle_timeout_seconds: cfg.stream_idle_timeout_seconds.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn cookie_header(session_token: &str) -> String {
        format!("{SESSION_COOKIE_NAME}={session_token}")
    }

    fn rpc_headers(&self, cred: &Credential) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ORIGIN, header_value(&self.base_url)?);
        headers.insert(CSRF_HEADER_NAME, header_value(&cred.anti_forgery_token)?);
        headers.insert(COOKIE, header_value(&Self::cookie_header(&cred.session_token))?);
        Ok(headers)
    }

    /// Loads the chats page. Without a cookie the backend provisions a new guest; with one it
    /// renews that identity and hands out a fresh anti-forgery token.
    pub async fn fetch_chats_page(
        &self,
        session_cookie: Option<&str>,
    ) -> Result<ChatPage, UpstreamError> {
        let mut url = reqwest::Url::parse(&format!("{}/chats", self.base_url))
            .map_err(|e| UpstreamError::Protocol(format!("invalid backend url: {e}")))?;
        let mut cookie = session_cookie.map(|s| s.to_string());
        let mut issued: Option<String> = None;

        for _ in 0..MAX_REDIRECTS {
            let mut req = self
                .client
                .get(url.clone())
                .header(
                    ACCEPT,
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                )
                .header(USER_AGENT, BROWSER_USER_AGENT)
                .timeout(self.request_timeout);
            if let Some(c) = cookie.as_deref() {
                req = req.header(COOKIE, header_value(&Self::cookie_header(c))?);
            }
            let resp = req.send().await?;

            if let Some(v) = session_cookie_from_headers(resp.headers()) {
                issued = Some(v.clone());
                cookie = Some(v);
            }

            let status = resp.status();
            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| UpstreamError::Protocol("redirect without location".into()))?;
                url = resp
                    .url()
                    .join(location)
                    .map_err(|e| UpstreamError::Protocol(format!("bad redirect target: {e}")))?;
                continue;
            }

            let code = status.as_u16();
            let html = resp.text().await?;
            if !status.is_success() {
                return Err(UpstreamError::from_status(code, &html));
            }
            let conf = extract_data_conf(&html)
                .ok_or_else(|| UpstreamError::Protocol("chats page has no data-conf".into()))?;
            let field = |k: &str| {
                conf.get(k)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            let csrf_token = field("csrf_token");
            if csrf_token.is_empty() {
                return Err(UpstreamError::Protocol(
                    "chats page did not include a csrf token".into(),
                ));
            }
            let workspace_id = Some(field("workspace_id")).filter(|w| !w.is_empty());
            return Ok(ChatPage {
                session_token: issued,
                csrf_token,
                username: field("username"),
                workspace_id,
            });
        }
        Err(UpstreamError::Protocol("too many redirects".into()))
    }

    /// Creates one chat session in the credential's workspace and returns its id.
    pub async fn create_chat_session(&self, cred: &Credential) -> Result<String, UpstreamError> {
        let payload = json!(["create_chat_session", Value::Null, cred.workspace_id]);
        let resp = self
            .client
            .post(format!("{}/rpc/db", self.base_url))
            .headers(self.rpc_headers(cred)?)
            .timeout(self.request_timeout)
            .body(payload.to_string())
            .send()
            .await?;
        let status = resp.status();
        let txt = resp.text().await?;
        if !status.is_success() {
            return Err(UpstreamError::from_status(status.as_u16(), &txt));
        }
        let v: Value = serde_json::from_str(&txt).map_err(|_| {
            UpstreamError::Protocol(format!(
                "create_chat_session returned non-json: {}",
                truncate_for_log(&txt, 120)
            ))
        })?;
        let id = match &v {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("id").and_then(|i| i.as_str()).map(|s| s.to_string()),
            _ => None,
        };
        id.filter(|s| !s.is_empty()).ok_or_else(|| {
            UpstreamError::Protocol("create_chat_session returned no session id".into())
        })
    }

    pub(crate) fn query_frame(
        &self,
        session_id: &str,
        query: &BackendQuery,
        prompt_template_id: Option<&str>,
        correlation_id: &str,
    ) -> Value {
        let mut llm_args = json!({
            "enable_vision": "auto",
            "visible_vision_models": ["auto"],
            "use_agent": false,
            "cost_controls": {
                "max_cost": 0.05,
                "willingness_to_pay": 1,
                "willingness_to_wait": 60
            },
            "remove_non_private": false
        });
        if let Some(t) = query.temperature.filter(|t| t.is_finite() && *t != 0.0) {
            llm_args["temperature"] = json!(t.clamp(0.0, 1.0));
        }
        let rag_config = json!({
            "rag_type": "auto",
            "hyde_no_rag_llm_prompt_extension": Value::Null,
            "num_neighbor_chunks_to_include": 1,
            "meta_data_to_include": {
                "name": true,
                "page": true,
                "text": true,
                "captions": true
            }
        });
        let mut frame = json!({
            "t": "cq",
            "mode": "s",
            "session_id": session_id,
            "correlation_id": correlation_id,
            "body": query.body,
            "llm": self.llm,
            "llm_args": llm_args.to_string(),
            "self_reflection_config": "null",
            "rag_config": rag_config.to_string(),
            "include_chat_history": self.include_chat_history,
            "tags": [],
            "prompt_template_id": prompt_template_id,
        });
        if let Some(sp) = query.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            frame["system_prompt"] = json!(sp);
        }
        frame
    }

    /// Opens the chat socket for `session_id`, sends the query and returns the answer as a
    /// lazy chunk stream. Dropping the stream closes the socket.
    pub async fn open_chat(
        &self,
        cred: &Credential,
        session_id: &str,
        query: &BackendQuery,
    ) -> Result<ChatChunks, UpstreamError> {
        let ws_url = format!("{}/ws?currentSessionID={session_id}", self.ws_base_url);
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Protocol(format!("invalid chat url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(COOKIE, header_value(&Self::cookie_header(&cred.session_token))?);
        headers.insert(CSRF_HEADER_NAME, header_value(&cred.anti_forgery_token)?);
        headers.insert(ORIGIN, header_value(&self.base_url)?);
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));

        let connected = tokio::time::timeout(
            self.request_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| UpstreamError::Transport("timed out opening chat socket".into()))?;
        let mut ws = match connected {
            Ok((ws, _)) => ws,
            Err(tungstenite::Error::Http(resp)) => {
                let status = resp.status().as_u16();
                let body = resp
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).to_string())
                    .unwrap_or_default();
                // The socket refuses an identity it does not trust with a bare 403.
                if status == 403 {
                    return Err(UpstreamError::Unauthorized(truncate_for_log(&body, 300)));
                }
                return Err(UpstreamError::from_status(status, &body));
            }
            Err(e) => return Err(UpstreamError::Transport(e.to_string())),
        };

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let frame = self.query_frame(
            session_id,
            query,
            cred.prompt_template_id.as_deref(),
            &correlation_id,
        );
        ws.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let idle_secs = self.idle_timeout_seconds;
        let stream = async_stream::stream! {
            let mut emitted = false;
            loop {
                let next = match tokio::time::timeout(Duration::from_secs(idle_secs), ws.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(UpstreamError::IdleTimeout(idle_secs));
                        break;
                    }
                };
                let msg = match next {
                    None => break,
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        yield Err(UpstreamError::Transport(e.to_string()));
                        break;
                    }
                };
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                match parse_frame(&text) {
                    BackendFrame::Partial(body) => {
                        if !body.is_empty() {
                            emitted = true;
                            yield Ok(body);
                        }
                    }
                    // Accumulated answer; only used when no partials arrived.
                    BackendFrame::Full(body) => {
                        if !emitted && !body.is_empty() {
                            emitted = true;
                            yield Ok(body);
                        }
                    }
                    BackendFrame::Done => break,
                    BackendFrame::Error(message) => {
                        yield Err(UpstreamError::from_chat_error(&message));
                        break;
                    }
                    BackendFrame::Context | BackendFrame::Other => continue,
                }
            }
            let _ = ws.close(None).await;
        };
        Ok(Box::pin(stream))
    }
}
