#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::Config,
    confirmation::ConfirmationRegistry,
    db::ProfileDb,
    dump::DumpExporter,
    profile::{ProfileService, store},
    server::{AppState, build_router},
};

pub mod config;
pub mod confirmation;
pub mod db;
pub mod dump;
pub mod permissions;
pub mod profile;
pub mod server;

/// Installs the global subscriber. `RUST_LOG` filters (default `info`);
/// `PROFILES_LOG_FORMAT=json` emits one JSON object per event.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("PROFILES_LOG_FORMAT")
        .map(|value| value.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub async fn build_profile_state(config: Config) -> Result<AppState> {
    let (store, exporter) = match config.db_url.clone() {
        Some(url) => {
            let db = Arc::new(ProfileDb::connect(url.as_str()).await?);
            db.ensure_schema().await?;
            let exporter = DumpExporter::new(
                config.dump_command.clone(),
                db.database_url(),
                config.dump_dir.clone(),
            );
            (
                store::postgres(db, Duration::from_millis(config.store_timeout_ms)),
                Some(Arc::new(exporter)),
            )
        }
        None => {
            warn!("DB_URL not set; profiles are kept in memory and lost on restart");
            (store::memory(), None)
        }
    };
    let profiles = Arc::new(ProfileService::new(
        store,
        Arc::new(ConfirmationRegistry::new()),
        exporter,
    ));
    Ok(AppState::new(config, profiles))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_profile_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "profile service listening"
    );
    axum::serve(listener, build_app(config).await?)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(reason = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("profile service shutting down");
}
