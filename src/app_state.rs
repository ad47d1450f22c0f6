use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::CONFIG_PATH_ENV;
use crate::orchestrator::backend::BackendGateway;
use crate::orchestrator::config::{AppConfig, IdentityKind};
use crate::orchestrator::credentials::CredentialStore;
use crate::orchestrator::gateway::GatewayState;
use crate::orchestrator::pool::SessionPool;
use crate::orchestrator::secrets::mask_secret;
use crate::orchestrator::upstream::UpstreamClient;

pub struct AppState {
    pub config_path: Option<PathBuf>,
    pub gateway: GatewayState,
}

/// Reads the TOML config at `path`, writing the defaults there first if the file is missing.
pub fn load_or_init_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let txt = std::fs::read_to_string(path)?;
        let cfg: AppConfig = toml::from_str(&txt)?;
        return Ok(cfg);
    }
    let cfg = AppConfig::default_config();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(&cfg)?)?;
    Ok(cfg)
}

/// File (if any) first, then the environment on top.
pub fn load_config<F>(config_path: Option<&Path>, lookup: F) -> anyhow::Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match config_path {
        Some(p) => load_or_init_config(p)?,
        None => AppConfig::default_config(),
    };
    cfg.apply_env_overrides(lookup)?;
    cfg.normalize();
    Ok(cfg)
}

pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn build_state(cfg: AppConfig, config_path: Option<PathBuf>) -> anyhow::Result<AppState> {
    if cfg.identity.kind == IdentityKind::Configured
        && (cfg.identity.session.is_empty() || cfg.identity.csrf_token.is_empty())
    {
        log::warn!(
            "configured identity is missing H2OGPTE_SESSION or H2OGPTE_CSRF_TOKEN; requests will fail until they are set"
        );
    }
    log::info!(
        "backend {} as {} identity (session={}, api_key={})",
        cfg.backend.base_url,
        cfg.identity.kind.as_str(),
        mask_secret(&cfg.identity.session),
        mask_secret(&cfg.api_key)
    );

    let upstream = UpstreamClient::new(&cfg.backend)?;
    let credentials = Arc::new(CredentialStore::new(&cfg, upstream.clone()));
    let backend = Arc::new(BackendGateway::new(credentials, upstream));
    let pool = SessionPool::new(cfg.pool.clone(), backend);

    Ok(AppState {
        config_path,
        gateway: GatewayState::new(Arc::new(cfg), pool),
    })
}
