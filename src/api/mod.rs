//! HTTP surface: `/health` for every role, `POST /orders` for the order role.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::types::ServiceRole;
use handlers::AppState;

/// Build the router for the role in `state`.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new().route("/health", get(handlers::health_check));
    if state.role == ServiceRole::Order {
        app = app.route("/orders", post(handlers::create_order));
    }

    app.with_state(state).layer(
        ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        ),
    )
}
