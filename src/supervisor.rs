//! Supervisor (C9): process-wide startup/teardown and port arbitration.
//!
//! Grounded on shimmy's `main.rs` startup banner/diagnostics idiom and `port_manager.rs`'s
//! bind-check loop, generalized from a single in-process engine bind to the public HTTP port.

use crate::config::Config;
use crate::state::{AppState, SharedState};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::info;

/// Bind-check-then-use, mirroring shimmy's `port_manager.rs` resolution loop: try the
/// configured port first, then scan upward a bounded number of times before giving up.
pub fn resolve_bind_address(host: &str, preferred_port: u16) -> anyhow::Result<SocketAddr> {
    const MAX_SCAN: u16 = 20;
    for offset in 0..MAX_SCAN {
        let port = preferred_port.wrapping_add(offset);
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .or_else(|_| format!("127.0.0.1:{port}").parse())?;
        if TcpListener::bind(addr).is_ok() {
            return Ok(addr);
        }
    }
    anyhow::bail!("no free port found near {preferred_port} on {host}");
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("LEMONADE_BUILD_VERSION"),
        host = %config.host,
        port = config.port,
        "starting lemonade-server-core"
    );

    let backend = crate::backend::detect();
    info!(cpu = %backend.cpu, npu = ?backend.npu, "backend detected");

    std::fs::create_dir_all(&config.cache_dir)?;
    let catalog = crate::catalog::Catalog::load(&config.cache_dir)?;
    let options = crate::options_store::OptionsStore::load(&config.cache_dir)?;

    let addr = resolve_bind_address(&config.host, config.port)?;
    let state: SharedState = Arc::new(AppState::new(config, backend, catalog, options));
    let router = crate::router::build(state.clone());

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

async fn shutdown_signal(state: SharedState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutting down, unloading all resident models");
    let grace = tokio::time::timeout(std::time::Duration::from_secs(10), state.scheduler.unload(None));
    if grace.await.is_err() {
        info!("graceful shutdown exceeded its grace period; remaining children are killed on drop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_bind_address_finds_a_free_port() {
        let addr = resolve_bind_address("127.0.0.1", 0).unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }
}
