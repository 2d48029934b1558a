//! rigworker -- control plane for a hardware-in-the-loop test rig.
//!
//! This crate exposes one device under test (a physical board on a Testbot
//! HAT, or a QEMU guest) through a uniform HTTP API: power, flashing,
//! network, console output, screen capture and a capability contract.

pub mod api;
pub mod capture;
pub mod config;
pub mod console;
pub mod contract;
pub mod flash;
pub mod target;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::WorkerConfig;
use crate::contract::{BalenaCloud, Contract, TagSource};

/// Resolve the capability contract for this process.
pub async fn resolve_contract(config: &WorkerConfig) -> Result<Contract> {
    let source = BalenaCloud::from_identity(&config.identity)
        .context("failed to build device-management client")?;
    let contract = contract::resolve(
        config.identity.device_uuid.as_deref(),
        &config.identity.worker_type,
        source.as_ref().map(|s| s as &dyn TagSource),
    )
    .await
    .context("failed to resolve capability contract")?;
    Ok(contract)
}

/// Start the worker: resolve the contract, set up the backend, serve the API.
///
/// Contract resolution and backend setup are fatal. The backend is torn
/// down when the server stops.
pub async fn serve(config: WorkerConfig) -> Result<()> {
    let worker = worker::build(&config)?;

    // 1. Capability contract
    let contract = resolve_contract(&config).await?;
    tracing::info!(contract = %contract.to_json(), "capability contract resolved");

    // 2. Backend
    worker.setup().await.context("worker setup failed")?;

    // 3. API server
    let state = api::state::AppState::new(
        Arc::clone(&worker),
        Arc::new(target::LocalResolver::new()),
        &contract,
        config.keepalive(),
        config.worker.workdir.clone(),
    );
    let app = api::router(state);

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, worker_type = %worker.worker_type(), "rigworker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped, tearing down worker");
    worker.teardown().await.context("worker teardown failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
