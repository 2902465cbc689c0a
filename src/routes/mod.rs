//! Route modules for the upload server

pub mod health;
pub mod upload;

use axum::{extract::DefaultBodyLimit, http::HeaderValue, routing::get, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router with its middleware stack
pub fn app(state: AppState) -> Router {
    let server = &state.config().server;

    let origin = if server.allowed_origin.trim() == "*" {
        AllowOrigin::from(Any)
    } else {
        match HeaderValue::from_str(server.allowed_origin.trim()) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                tracing::warn!(
                    origin = %server.allowed_origin,
                    "Invalid ALLOWED_ORIGIN, allowing any origin"
                );
                AllowOrigin::from(Any)
            }
        }
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = server.max_body_size;

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/upload", upload::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
