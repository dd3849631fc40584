mod config;
mod db;
mod envelope;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::bridge::{Bridge, RedisBroker};
use services::hub::{Collaborators, Hub, HubSettings};
use services::store::PgStore;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::HubConfig::from_env().expect("invalid configuration");

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("database init failed");
    let store = Arc::new(PgStore::new(pool));
    let collaborators = Collaborators { store: store.clone(), identity: store.clone(), presence: store };

    let bridge = match &config.redis_url {
        Some(url) => {
            let broker = RedisBroker::connect(url).await.expect("redis connect failed");
            let bridge = Bridge::new(Arc::new(broker), &config.bridge_channel_prefix);
            tracing::info!(instance_id = %bridge.instance_id(), "scale-out bridge enabled");
            Some(bridge)
        }
        None => {
            tracing::info!("REDIS_URL not set; running single-instance");
            None
        }
    };

    let settings = HubSettings {
        collaborator_timeout: config.collaborator_timeout,
        max_content_chars: config.max_content_chars,
    };
    let hub = Hub::new(collaborators, settings, bridge.clone());
    let subscriber = bridge.map(|b| services::bridge::spawn_subscriber(b, hub.clone()));

    let state = state::AppState::new(hub.clone(), config.limits);
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, bridged = subscriber.is_some(), "chathub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    hub.shutdown().await;
    if let Some(handle) = subscriber {
        handle.abort();
    }
    tracing::info!("chathub stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
