//! deskwire - realtime customer-support chat backend
//!
//! Brokers conversations between web visitors, an AI model and human
//! agents over a room-based WebSocket transport.

mod agents;
mod api;
mod auth;
mod config;
mod db;
mod dispatch;
mod events;
mod fetch;
mod hub;
mod llm;
mod matcher;
mod notify;
mod presence;
mod proactive;
mod redact;
mod session;
mod spool;

use api::{create_router, AppState};
use config::Config;
use db::Database;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deskwire=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    if config.gemini_api_key.is_some() {
        tracing::info!(model = %config.gemini_model, "AI generation enabled");
    } else {
        tracing::warn!("GEMINI_API_KEY not set; AI replies fall back to the unavailable message");
    }

    let port = config.port;
    let state = AppState::new(db, &config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("deskwire listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
