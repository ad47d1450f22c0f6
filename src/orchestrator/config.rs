use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKEND_BASE_URL, DEFAULT_GUEST_WORKSPACE_ID, DEFAULT_LISTEN_HOST, DEFAULT_LISTEN_PORT,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// LLM selector sent with every chat query. The inbound `model` field is not forwarded.
    pub llm: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_id: Option<String>,
    /// Pooled sessions are reused across requests and the full conversation is resent each
    /// time, so backend-side history stays off unless explicitly configured.
    #[serde(default = "default_include_chat_history")]
    pub include_chat_history: String,
    pub request_timeout_seconds: u64,
    pub stream_idle_timeout_seconds: u64,
    /// Identifiers served by `/v1/models`.
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_include_chat_history() -> String {
    "off".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Guest,
    Configured,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::Guest => "guest",
            IdentityKind::Configured => "configured",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub kind: IdentityKind,
    /// Static session cookie for a configured identity.
    ///
    /// Ignored for guests, which provision their own.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub csrf_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub target_size: usize,
    pub checkout_timeout_ms: u64,
    pub maintain_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen: ListenConfig,
    pub backend: BackendConfig,
    pub identity: IdentityConfig,
    pub pool: PoolConfig,
    /// Inbound key check. Empty disables it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

pub fn default_models() -> Vec<String> {
    [
        "auto",
        "claude-sonnet-4-5-20250929",
        "claude-3-7-sonnet",
        "claude-3-5-sonnet",
        "deepseek-ai/DeepSeek-R1",
        "deepseek-ai/DeepSeek-V3",
        "gpt-4.1",
        "gpt-4o",
        "gpt-5",
        "gemini-2.5-pro",
        "gemini-2.5-flash",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AppConfig {
    pub fn default_config() -> Self {
        Self {
            listen: ListenConfig {
                host: DEFAULT_LISTEN_HOST.to_string(),
                port: DEFAULT_LISTEN_PORT,
            },
            backend: BackendConfig {
                base_url: DEFAULT_BACKEND_BASE_URL.to_string(),
                llm: "auto".to_string(),
                workspace_id: DEFAULT_GUEST_WORKSPACE_ID.to_string(),
                prompt_template_id: None,
                include_chat_history: default_include_chat_history(),
                request_timeout_seconds: 60,
                stream_idle_timeout_seconds: 120,
                models: default_models(),
            },
            identity: IdentityConfig {
                kind: IdentityKind::Guest,
                session: String::new(),
                csrf_token: String::new(),
            },
            pool: PoolConfig {
                target_size: 3,
                checkout_timeout_ms: 1_500,
                maintain_interval_ms: 2_000,
                backoff_base_ms: 5_000,
                backoff_max_ms: 60_000,
            },
            api_key: String::new(),
        }
    }

    /// Applies the environment variables the service has always honoured on top of the
    /// file/default config. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(v) = get("H2OGPTE_BASE_URL").filter(|v| !v.is_empty()) {
            self.backend.base_url = v;
        }
        if let Some(v) = get("IS_GUEST") {
            self.identity.kind = if matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
            {
                IdentityKind::Guest
            } else {
                IdentityKind::Configured
            };
        }
        if let Some(v) = get("H2OGPTE_SESSION") {
            self.identity.session = v;
        }
        if let Some(v) = get("H2OGPTE_CSRF_TOKEN") {
            self.identity.csrf_token = v;
        }
        if let Some(v) = get("H2OGPTE_WORKSPACE_ID").filter(|v| !v.is_empty()) {
            self.backend.workspace_id = v;
        }
        if let Some(v) = get("H2OGPTE_PROMPT_TEMPLATE_ID") {
            self.backend.prompt_template_id = Some(v).filter(|v| !v.is_empty());
        }
        if let Some(v) = get("HOST").filter(|v| !v.is_empty()) {
            self.listen.host = v;
        }
        if let Some(v) = get("PORT").filter(|v| !v.is_empty()) {
            self.listen.port = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PORT {v:?}: {e}"))?;
        }
        if let Some(v) = get("API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = get("POOL_SIZE").filter(|v| !v.is_empty()) {
            self.pool.target_size = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid POOL_SIZE {v:?}: {e}"))?;
        }
        Ok(())
    }

    pub fn normalize(&mut self) {
        self.backend.base_url = self.backend.base_url.trim_end_matches('/').to_string();
        if self.backend.models.is_empty() {
            self.backend.models = default_models();
        }
        if self.backend.stream_idle_timeout_seconds == 0 {
            self.backend.stream_idle_timeout_seconds = 120;
        }
    }
}
