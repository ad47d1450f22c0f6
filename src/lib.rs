mod app_state;
pub mod constants;
pub mod orchestrator;

use crate::app_state::{build_state, config_path_from_env, load_config};
use crate::orchestrator::gateway::{bind_listener, serve};

/// `RUST_LOG` if set, otherwise `info`. Also routes the `log` macros used across the crate.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("shutdown requested");
}

pub async fn run() -> anyhow::Result<()> {
    init_logging();

    let config_path = config_path_from_env();
    let cfg = load_config(config_path.as_deref(), |k| std::env::var(k).ok())?;
    let state = build_state(cfg, config_path)?;
    if let Some(p) = state.config_path.as_ref() {
        log::info!("config loaded from {}", p.display());
    }
    let gateway = state.gateway.clone();

    let listener = bind_listener(&gateway.cfg).await?;
    log::info!("listening on http://{}", listener.local_addr()?);

    // The first maintenance pass warms the pool; shutdown waits for it.
    gateway.pool.start();

    let result = serve(gateway.clone(), listener, shutdown_signal()).await;
    gateway.pool.shutdown().await;
    result
}
