use std::{net::Ipv4Addr, process::ExitCode, sync::Arc};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use todolists::config::ServerConfig;
use todolists::{create_app, db, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let db = match db::init_db(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            error!(path = %config.db_path, "initializing database: {e}");
            return ExitCode::FAILURE;
        }
    };
    match db::cleanup_expired_sessions(&db) {
        Ok(removed) => info!(removed, "Purged expired sessions"),
        Err(e) => error!("purging expired sessions: {e}"),
    }

    let state = AppState {
        db,
        anon_key: Arc::new(config.anon_key),
        base_path: Arc::new(config.base_path),
        confirm_email: config.confirm_email,
    };
    let app = create_app(state);
    let addr = (Ipv4Addr::UNSPECIFIED, config.port);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("binding to port {}: {e}", config.port);
            return ExitCode::FAILURE;
        }
    };

    info!("running on {addr:?}");

    if let Err(e) = axum::serve(listener, app).await {
        error!("failed serving: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
