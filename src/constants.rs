pub const DEFAULT_BACKEND_BASE_URL: &str = "https://h2ogpte.genai.h2o.ai";
pub const DEFAULT_GUEST_WORKSPACE_ID: &str = "workspaces/h2ogpte-guest";
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 2156;
pub const SESSION_COOKIE_NAME: &str = "h2ogpte.session";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
pub const MODEL_OWNER: &str = "h2ogpte";
pub const CONFIG_PATH_ENV: &str = "H2OGPTE_GATEWAY_CONFIG";
