//! Kestrel worker instance: HTTP intake, request dispatch and fleet membership.

#![forbid(unsafe_code)]

mod dto;
mod error;
mod handlers;
mod state;
mod worker_config;
mod worker_router;
mod worker_services;

use std::sync::Arc;

use kestrel_core::AppError;
use tracing::{error, info, warn};

use crate::state::AppState;
use crate::worker_config::{WorkerConfig, init_tracing};
use crate::worker_services::{build_coordination_store, build_durable_stores, build_instance};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let address = config.listen_address()?;
    let store = build_coordination_store(&config)?;
    let durable = build_durable_stores(&config).await?;
    let instance = Arc::new(build_instance(&config, store, &durable)?);

    instance.start().await?;
    info!(
        instance = %instance.name(),
        concurrency = config.concurrency,
        queue_capacity = config.queue_capacity,
        lease_seconds = config.lease_seconds,
        "kestrel-worker started"
    );

    let app = worker_router::build_router(AppState {
        instance: instance.clone(),
    });

    let listener = match tokio::net::TcpListener::bind(address).await {
        Ok(listener) => listener,
        Err(bind_error) => {
            if let Err(shutdown_error) = instance.shutdown().await {
                warn!(error = %shutdown_error, "instance shutdown after bind failure failed");
            }
            return Err(AppError::Internal(format!(
                "failed to bind listener: {bind_error}"
            )));
        }
    };

    info!(%address, "kestrel-worker listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| AppError::Internal(format!("worker server error: {error}")));

    info!(instance = %instance.name(), "draining instance");
    instance.shutdown().await?;
    info!(instance = %instance.name(), "kestrel-worker stopped");

    served
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("received interrupt, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
