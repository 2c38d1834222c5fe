//! Kindred - companion app core
//!
//! Serves the chat, mission and operator screens of a companion app over a
//! local HTTP API. The persona's replies come from a remote text-generation
//! service; every piece of app state is persisted to a local key-value store.

mod api;
mod config;
mod db;
mod llm;
mod runtime;
mod state_machine;
mod system_prompt;

use api::{create_router, AppState};
use config::Config;
use db::Database;
use llm::{GeminiService, LlmService, LoggingService, ResponseGateway};
use runtime::{DatabaseStore, StateManager, SystemClock};
use std::net::SocketAddr;
use std::sync::Arc;
use system_prompt::Persona;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kindred=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    let service: Arc<dyn LlmService> = Arc::new(LoggingService::new(Arc::new(
        GeminiService::new(&config.base_url, &config.model),
    )));
    let persona = Persona::load(config.persona_path.as_deref());
    let gateway =
        Arc::new(ResponseGateway::new(service, persona).with_timeout(config.turn_timeout));

    if config.api_key.is_none() {
        tracing::warn!("No default credential. Set KINDRED_API_KEY or enter one in the operator panel.");
    }
    tracing::info!(model = %config.model, timeout = ?config.turn_timeout, "Response gateway ready");

    let manager = Arc::new(StateManager::new(
        DatabaseStore::new(db),
        gateway,
        Arc::new(SystemClock),
        config.api_key.clone(),
    ));
    manager.restore().await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(AppState::new(manager.clone()))
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Kindred server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

/// Resolves on ctrl-c, after cancelling any turn still waiting on the service
async fn shutdown_signal(manager: Arc<StateManager<DatabaseStore>>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    manager.shutdown();
}
