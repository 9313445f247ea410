//! Event Publisher
//!
//! Serialises domain facts to JSON and hands them to the broker. A publish
//! resolves once the broker has accepted the frame; consumers are not
//! waited for. Failures are returned to the caller, who decides whether the
//! originating request fails.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, instrument};

use super::broker::{BrokerChannel, OutgoingMessage};
use super::errors::MessagingError;
use crate::types::OrderCreatedEvent;

/// Publishes events to one exchange over an injected channel.
#[derive(Clone)]
pub struct EventPublisher {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
}

impl EventPublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish an order-created fact with an empty binding key.
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn publish_order_created(
        &self,
        event: &OrderCreatedEvent,
    ) -> Result<(), MessagingError> {
        self.publish(&self.exchange, "", event).await
    }

    /// Serialise `payload` as JSON and publish it to `exchange`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        binding_key: &str,
        payload: &T,
    ) -> Result<(), MessagingError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| MessagingError::publish_failure(exchange, e.to_string()))?;
        let size = body.len();

        match self
            .channel
            .publish(exchange, binding_key, OutgoingMessage::json(body))
            .await
        {
            Ok(()) => {
                debug!(exchange, binding_key, size, "Event published");
                Ok(())
            }
            Err(e) => {
                error!(exchange, binding_key, error = %e, "Failed to publish event");
                Err(MessagingError::publish_failure(exchange, e.to_string()))
            }
        }
    }
}
