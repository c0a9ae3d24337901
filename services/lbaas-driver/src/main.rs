//! lbaas-driver service.
//!
//! Loads the device registry, optionally opens the binding database, and
//! serves health probes and placement lookups over HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lbaas_driver::{
    api,
    config::Config,
    db::Database,
    registry::StaticRegistry,
    resolver::DeviceResolver,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to LBAAS_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting lbaas-driver");
    info!(
        listen_addr = %config.listen_addr,
        devices_file = %config.devices_file.display(),
        placement = ?config.placement,
        "Configuration loaded"
    );

    let registry = Arc::new(
        StaticRegistry::from_file(&config.devices_file, config.ring_replicas)
            .with_context(|| format!("failed to load {}", config.devices_file.display()))?,
    );

    let db = if config.uses_database() {
        let db = match Database::connect(&config.database).await {
            Ok(db) => {
                info!("Database connection established");
                db
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to database");
                return Err(e.into());
            }
        };

        if config.dev_mode {
            info!("Running database migrations (dev mode)");
            if let Err(e) = db.run_migrations().await {
                error!(error = %e, "Failed to run migrations");
                return Err(e.into());
            }
        }
        Some(db)
    } else {
        None
    };

    let resolver = Arc::new(match &db {
        Some(db) => DeviceResolver::with_bindings(
            registry.clone(),
            Arc::new(db.binding_store()),
            config.stale_binding,
        ),
        None => DeviceResolver::hash_only(registry.clone()),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload_handle = config.registry_reload_interval.map(|interval| {
        let registry = registry.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(reload_registry(registry, interval, shutdown_rx))
    });

    let app = api::create_router(AppState::new(resolver, db));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Some(handle) = reload_handle {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Registry reload task did not shut down in time");
        }
    }

    info!("lbaas-driver shutdown complete");
    Ok(())
}

/// Re-read the registry file every `interval` until shutdown. A failed
/// reload keeps the previous snapshot.
async fn reload_registry(
    registry: Arc<StaticRegistry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = registry.reload() {
                    warn!(error = %e, "Registry reload failed, keeping previous devices");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
