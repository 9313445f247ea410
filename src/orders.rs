//! Order placement: commit the order, then announce it.
//!
//! The event is published only after the insert has succeeded, so a failed
//! write never produces an event. A publish failure after a successful write
//! is not compensated; [`PublishFailurePolicy`] decides whether the caller
//! sees it.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::messaging::{EventPublisher, MessagingError};
use crate::store::{OrderStore, StoreError};
use crate::types::{NewOrder, OrderRecord, PublishFailurePolicy};

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("Invalid order: {0}")]
    Invalid(String),

    #[error("Could not store order: {0}")]
    Store(#[from] StoreError),

    /// The order row exists; only the event is missing.
    #[error("Order {order_id} was stored but its event was not published: {source}")]
    Publish {
        order_id: i64,
        #[source]
        source: MessagingError,
    },
}

/// Result of a placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order: OrderRecord,
    pub event_published: bool,
}

/// The producer-side call-point.
pub struct OrderPlacement {
    store: Arc<dyn OrderStore>,
    publisher: EventPublisher,
    policy: PublishFailurePolicy,
}

impl OrderPlacement {
    pub fn new(
        store: Arc<dyn OrderStore>,
        publisher: EventPublisher,
        policy: PublishFailurePolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            policy,
        }
    }

    #[instrument(
        skip(self, order),
        fields(user_id = order.user_id, restaurant_id = order.restaurant_id)
    )]
    pub async fn place_order(&self, order: &NewOrder) -> Result<PlacedOrder, PlacementError> {
        if !order.total_amount.is_finite() || order.total_amount < 0.0 {
            return Err(PlacementError::Invalid(format!(
                "total amount {} must be a non-negative number",
                order.total_amount
            )));
        }

        let record = self.store.insert_order(order).await?;
        info!(order_id = record.order_id, "Order stored");

        match self.publisher.publish_order_created(&record.created_event()).await {
            Ok(()) => Ok(PlacedOrder {
                order: record,
                event_published: true,
            }),
            Err(source) => match self.policy {
                PublishFailurePolicy::FailRequest => {
                    error!(
                        order_id = record.order_id,
                        error = %source,
                        "Order event not published"
                    );
                    Err(PlacementError::Publish {
                        order_id: record.order_id,
                        source,
                    })
                }
                PublishFailurePolicy::Proceed => {
                    warn!(
                        order_id = record.order_id,
                        error = %source,
                        "Order event not published, continuing"
                    );
                    Ok(PlacedOrder {
                        order: record,
                        event_published: false,
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{
        BrokerChannel, InMemoryBroker, QueueSpec, TopologyManager, TopologySpec, DISPATCH_QUEUE,
        ORDER_EVENTS_EXCHANGE,
    };
    use crate::store::MemoryStore;
    use crate::types::OrderCreatedEvent;

    type Setup = (InMemoryBroker, MemoryStore, Arc<dyn BrokerChannel>, OrderPlacement);

    async fn setup(policy: PublishFailurePolicy) -> Setup {
        let broker = InMemoryBroker::new();
        let channel: Arc<dyn BrokerChannel> = Arc::new(broker.connect().unwrap());
        TopologyManager::new(Arc::clone(&channel))
            .declare(
                &TopologySpec::fanout(ORDER_EVENTS_EXCHANGE)
                    .with_queue(QueueSpec::durable(DISPATCH_QUEUE)),
            )
            .await
            .unwrap();
        let store = MemoryStore::new();
        let placement = OrderPlacement::new(
            Arc::new(store.clone()),
            EventPublisher::new(Arc::clone(&channel), ORDER_EVENTS_EXCHANGE),
            policy,
        );
        (broker, store, channel, placement)
    }

    fn order() -> NewOrder {
        NewOrder {
            user_id: 7,
            restaurant_id: 3,
            total_amount: 19.99,
        }
    }

    #[tokio::test]
    async fn test_commit_then_publish() {
        let (broker, store, _channel, placement) = setup(PublishFailurePolicy::FailRequest).await;

        let placed = placement.place_order(&order()).await.unwrap();

        assert!(placed.event_published);
        assert_eq!(store.orders().len(), 1);
        let messages = broker.peek_messages(DISPATCH_QUEUE);
        assert_eq!(messages.len(), 1);
        let event: OrderCreatedEvent = serde_json::from_slice(&messages[0].body).unwrap();
        assert_eq!(event.order_id, placed.order.order_id);
        assert_eq!(event.total_amount, Some(19.99));
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let (broker, store, _channel, placement) = setup(PublishFailurePolicy::FailRequest).await;
        store.fail_next_writes(1);

        let err = placement.place_order(&order()).await.unwrap_err();

        assert!(matches!(err, PlacementError::Store(_)));
        assert_eq!(broker.message_count(DISPATCH_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_fails_request() {
        let (_broker, store, channel, placement) = setup(PublishFailurePolicy::FailRequest).await;
        channel.close().await.unwrap();

        let err = placement.place_order(&order()).await.unwrap_err();

        assert!(matches!(err, PlacementError::Publish { order_id: 1, .. }));
        // the order stays committed
        assert_eq!(store.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_can_proceed() {
        let (_broker, _store, channel, placement) = setup(PublishFailurePolicy::Proceed).await;
        channel.close().await.unwrap();

        let placed = placement.place_order(&order()).await.unwrap();

        assert!(!placed.event_published);
    }

    #[tokio::test]
    async fn test_negative_total_is_invalid() {
        let (_broker, store, _channel, placement) = setup(PublishFailurePolicy::FailRequest).await;
        let mut bad = order();
        bad.total_amount = -5.0;

        assert!(matches!(
            placement.place_order(&bad).await,
            Err(PlacementError::Invalid(_))
        ));
        assert!(store.orders().is_empty());
    }
}
