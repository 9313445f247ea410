//! Orders as seen by the producing side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::OrderCreatedEvent;

/// Request body for placing an order.
///
/// `totalPrice` is accepted as a legacy spelling of `totalAmount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub user_id: i64,
    pub restaurant_id: i64,
    #[serde(alias = "totalPrice")]
    pub total_amount: f64,
}

/// A committed order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub order_id: i64,
    pub user_id: i64,
    pub restaurant_id: i64,
    pub total_amount: f64,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    /// The event announcing this order.
    pub fn created_event(&self) -> OrderCreatedEvent {
        OrderCreatedEvent::new(self.order_id)
            .with_user(self.user_id)
            .with_restaurant(self.restaurant_id)
            .with_total_amount(self.total_amount)
    }
}
