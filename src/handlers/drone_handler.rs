//! Drone service effect: log the delivery task.

use async_trait::async_trait;
use tracing::info;

use super::base::{EventHandler, HandlerError};
use crate::types::OrderCreatedEvent;

/// Logs each order taken off the dispatch queue.
#[derive(Debug, Default)]
pub struct DroneHandler;

#[async_trait]
impl EventHandler for DroneHandler {
    type Event = OrderCreatedEvent;

    fn name(&self) -> &'static str {
        "drone"
    }

    async fn handle(&self, event: &OrderCreatedEvent) -> Result<(), HandlerError> {
        info!(
            order_id = event.order_id,
            restaurant_id = event.restaurant_id,
            "Drone received order"
        );
        Ok(())
    }
}
