//! Order event wire schema.

use serde::{Deserialize, Serialize};

/// Fact published once an order row has been committed.
///
/// The canonical wire form is a camelCase JSON object with `totalAmount`.
/// Older producers emit `totalPrice` instead; it is accepted on input and
/// normalised into `total_amount`. Only `orderId` is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "OrderCreatedWire")]
pub struct OrderCreatedEvent {
    pub order_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
}

/// Everything any producer revision has been seen to send.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreatedWire {
    order_id: i64,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    restaurant_id: Option<i64>,
    #[serde(default)]
    total_amount: Option<f64>,
    #[serde(default)]
    total_price: Option<f64>,
}

impl From<OrderCreatedWire> for OrderCreatedEvent {
    fn from(wire: OrderCreatedWire) -> Self {
        Self {
            order_id: wire.order_id,
            user_id: wire.user_id,
            restaurant_id: wire.restaurant_id,
            total_amount: wire.total_amount.or(wire.total_price),
        }
    }
}

impl OrderCreatedEvent {
    /// Create an event carrying only the order identity.
    pub fn new(order_id: i64) -> Self {
        Self {
            order_id,
            user_id: None,
            restaurant_id: None,
            total_amount: None,
        }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_restaurant(mut self, restaurant_id: i64) -> Self {
        self.restaurant_id = Some(restaurant_id);
        self
    }

    pub fn with_total_amount(mut self, total_amount: f64) -> Self {
        self.total_amount = Some(total_amount);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_canonical_payload() {
        let body = br#"{"orderId": 42, "userId": 7, "restaurantId": 3, "totalAmount": 19.99}"#;
        let event: OrderCreatedEvent = serde_json::from_slice(body).unwrap();

        assert_eq!(
            event,
            OrderCreatedEvent::new(42)
                .with_user(7)
                .with_restaurant(3)
                .with_total_amount(19.99)
        );
    }

    #[test]
    fn test_decode_legacy_total_price() {
        let body = br#"{"orderId": 5, "userId": 1, "restaurantId": 2, "totalPrice": 12.5}"#;
        let event: OrderCreatedEvent = serde_json::from_slice(body).unwrap();
        assert_eq!(event.total_amount, Some(12.5));
    }

    #[test]
    fn test_total_amount_wins_over_total_price() {
        let body = br#"{"orderId": 5, "totalAmount": 10.0, "totalPrice": 99.0}"#;
        let event: OrderCreatedEvent = serde_json::from_slice(body).unwrap();
        assert_eq!(event.total_amount, Some(10.0));
    }

    #[test]
    fn test_optional_fields_may_be_missing() {
        let event: OrderCreatedEvent = serde_json::from_slice(br#"{"orderId": 9}"#).unwrap();
        assert_eq!(event, OrderCreatedEvent::new(9));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let body = br#"{"orderId": 9, "currency": "VND"}"#;
        assert!(serde_json::from_slice::<OrderCreatedEvent>(body).is_ok());
    }

    #[test]
    fn test_missing_order_id_is_rejected() {
        let body = br#"{"userId": 7}"#;
        assert!(serde_json::from_slice::<OrderCreatedEvent>(body).is_err());
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(serde_json::from_slice::<OrderCreatedEvent>(b"not json").is_err());
        assert!(serde_json::from_slice::<OrderCreatedEvent>(b"42").is_err());
    }

    #[test]
    fn test_serializes_canonical_field_names() {
        let event = OrderCreatedEvent::new(1).with_total_amount(3.5);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json, serde_json::json!({"orderId": 1, "totalAmount": 3.5}));
    }
}
