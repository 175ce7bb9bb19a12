use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docit_server::{
    config::{self, DEFAULT_JWT_SECRET},
    db,
    registry::CloseReason,
    routes, AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up secrets from .env before anything reads the environment
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docit_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    tracing::info!("Starting DocIt server on {}:{}", config.server.host, config.server.port);
    if config.auth.jwt_secret == DEFAULT_JWT_SECRET {
        tracing::warn!("Using the default JWT secret; set JWT_SECRET before deploying");
    }

    // Initialize database
    let db = db::Database::new(&config.database.path).await?;
    db.run_migrations().await?;

    // Create app state
    let state = AppState::new(db, config.clone());
    let registry = state.registry.clone();

    // Build router
    let app = routes::create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
            registry.close_all(CloseReason::Shutdown);
        })
        .await?;

    Ok(())
}
