use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::proxy::handler::proxy_handler;
use crate::AppState;

pub mod login;

/// Builds the full gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/healthz", get(|| async { "ok" }))
        // Device-code login
        .route("/login", get(login::login).post(login::login))
        .route("/login/poll", post(login::login_poll))
        .route("/ws/poll", get(login::ws_poll))
        // Proxied completion API
        .route("/chat/completions", any(proxy_handler))
        .route("/v1/chat/completions", any(proxy_handler))
        .route("/models", any(proxy_handler))
        .route("/v1/models", any(proxy_handler))
        .with_state(state)
        // Enforce 25 MB body size limit on all routes
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
}
