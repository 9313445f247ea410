//! Notification service effect: tell the user their order was placed.

use async_trait::async_trait;
use tracing::info;

use super::base::{EventHandler, HandlerError};
use crate::types::OrderCreatedEvent;

/// Logs receipt of every order event. Touches no store.
#[derive(Debug, Default)]
pub struct NotificationHandler;

#[async_trait]
impl EventHandler for NotificationHandler {
    type Event = OrderCreatedEvent;

    fn name(&self) -> &'static str {
        "notification"
    }

    async fn handle(&self, event: &OrderCreatedEvent) -> Result<(), HandlerError> {
        info!(
            order_id = event.order_id,
            user_id = event.user_id,
            total_amount = event.total_amount,
            "Notification: order event received"
        );
        Ok(())
    }
}
