//! Dispatch service effect: one dispatch record per order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::base::{EventHandler, HandlerError};
use crate::store::DispatchStore;
use crate::types::{NewDispatch, OrderCreatedEvent};

/// Inserts an `Assigned` dispatch with the placeholder drone for each order.
pub struct DispatchHandler {
    store: Arc<dyn DispatchStore>,
}

impl DispatchHandler {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for DispatchHandler {
    type Event = OrderCreatedEvent;

    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn handle(&self, event: &OrderCreatedEvent) -> Result<(), HandlerError> {
        if event.order_id <= 0 {
            return Err(HandlerError::Rejected(format!(
                "order id {} is not a valid identifier",
                event.order_id
            )));
        }

        let record = self
            .store
            .insert_dispatch(&NewDispatch::assigned(event.order_id))
            .await?;

        info!(
            order_id = record.order_id,
            dispatch_id = record.dispatch_id,
            drone_id = record.drone_id,
            status = %record.status,
            "Dispatch created"
        );
        Ok(())
    }
}
