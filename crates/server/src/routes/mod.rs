use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod auth;
mod health;
mod workspaces;
mod ws;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Auth routes
        .route("/api/auth/google", get(auth::google_url))
        .route("/api/auth/google/callback", post(auth::google_callback))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/auth/me", get(auth::me).patch(auth::update_me))
        // Workspaces
        .route("/api/workspaces", post(workspaces::create))
        .route("/api/workspaces/:id", get(workspaces::show))
        .route("/api/workspaces/:id/invite", post(workspaces::invite))
        .route(
            "/api/workspaces/:id/members/:user_id/role",
            patch(workspaces::update_role),
        )
        .route(
            "/api/workspaces/:id/members/:user_id",
            delete(workspaces::remove_member),
        )
        // Chat upgrade
        .route("/ws", get(ws::ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
