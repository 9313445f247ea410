//! HTTP request handlers for the order event services.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::info;

use crate::messaging::{ConnectionState, ConnectionStatus, ConsumerStats, ConsumerStatsSnapshot};
use crate::orders::{OrderPlacement, PlacementError};
use crate::types::{NewOrder, ServiceRole};

/// Application state shared across handlers.
pub struct AppState {
    pub role: ServiceRole,
    pub broker: ConnectionStatus,
    /// Present for roles that use the backing store
    pub store: Option<ConnectionStatus>,
    /// Present for the order role
    pub placement: Option<OrderPlacement>,
    /// Present for consuming roles
    pub consumer_stats: Option<Arc<ConsumerStats>>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    role: ServiceRole,
    version: &'static str,
    broker: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<ConnectionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    consumer: Option<ConsumerStatsSnapshot>,
}

/// Health check endpoint. Degraded (503) while any supervised connection is
/// down.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = state.broker.get();
    let store = state.store.as_ref().map(ConnectionStatus::get);
    let healthy = broker == ConnectionState::Connected
        && store.map_or(true, |s| s == ConnectionState::Connected);

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        role: state.role,
        version: env!("CARGO_PKG_VERSION"),
        broker,
        store,
        consumer: state.consumer_stats.as_ref().map(|s| s.snapshot()),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    order_id: i64,
    event_published: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
}

/// Commit an order and publish its event.
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewOrder>,
) -> Result<Json<CreateOrderResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Some(placement) = &state.placement else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("the {} service does not accept orders", state.role),
        ));
    };

    match placement.place_order(&request).await {
        Ok(placed) => {
            info!(
                order_id = placed.order.order_id,
                event_published = placed.event_published,
                "Order placed"
            );
            Ok(Json(CreateOrderResponse {
                order_id: placed.order.order_id,
                event_published: placed.event_published,
            }))
        }
        Err(e @ PlacementError::Invalid(_)) => {
            Err(error_response(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

fn error_response(code: StatusCode, error: String) -> (StatusCode, Json<ErrorResponse>) {
    (code, Json(ErrorResponse { error }))
}
