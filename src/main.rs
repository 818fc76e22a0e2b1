//! Chat orchestrator
//!
//! Receives conversation updates from messaging platforms, coalesces
//! concurrent updates per conversation, runs the configured AI endpoint in
//! the background, and dispatches the AI's decision back to the platform.

mod ai_client;
mod api;
mod config;
mod config_store;
mod db;
mod dispatch;
mod handler;
mod history;
mod jobs;
mod lock;
mod store;
mod worker;

use api::{create_router, AppState};
use config::Settings;
use db::Database;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use store::{RedisStore, SharedStore};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_orchestrator=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let settings = Settings::from_env();

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&settings.database_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %settings.database_path, "Opening database");
    let db = Database::open(&settings.database_path)?;

    // The shared store degrades to in-memory when Redis is absent or down;
    // that breaks cross-instance lock exclusivity, so say so loudly
    let primary = match &settings.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(backend) => {
                tracing::info!("Connected to shared store");
                Some(backend)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Shared store unreachable, starting with in-memory fallback");
                None
            }
        },
        None => {
            tracing::warn!("No REDIS_URL configured, locks are process-local");
            None
        }
    };
    let store = SharedStore::new(primary);

    // Create application state
    let state = AppState::new(db, store, settings.clone());

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    // Start server
    let host: IpAddr = settings.api_host.parse().unwrap_or([0, 0, 0, 0].into());
    let addr = SocketAddr::new(host, settings.api_port);
    tracing::info!("Chat orchestrator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
