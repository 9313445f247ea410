//! Dispatch records created in response to order events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Drone assigned to every new dispatch until real allocation exists.
pub const PLACEHOLDER_DRONE_ID: i64 = 1;

/// Lifecycle status of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchStatus {
    /// A drone has been assigned but has not left
    Assigned,
    /// The drone is on its way
    InTransit,
    /// The order reached the customer
    Delivered,
    /// The dispatch was abandoned
    Cancelled,
}

impl DispatchStatus {
    /// Name as stored in the backing store.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Assigned => "Assigned",
            DispatchStatus::InTransit => "InTransit",
            DispatchStatus::Delivered => "Delivered",
            DispatchStatus::Cancelled => "Cancelled",
        }
    }

    /// Parse a stored status name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Assigned" => Some(DispatchStatus::Assigned),
            "InTransit" => Some(DispatchStatus::InTransit),
            "Delivered" => Some(DispatchStatus::Delivered),
            "Cancelled" => Some(DispatchStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dispatch to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDispatch {
    pub order_id: i64,
    pub drone_id: i64,
    pub status: DispatchStatus,
}

impl NewDispatch {
    /// Dispatch for a freshly created order.
    pub fn assigned(order_id: i64) -> Self {
        Self {
            order_id,
            drone_id: PLACEHOLDER_DRONE_ID,
            status: DispatchStatus::Assigned,
        }
    }
}

/// A stored dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    /// Store-generated identifier
    pub dispatch_id: i64,
    pub order_id: i64,
    pub drone_id: i64,
    pub status: DispatchStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assigned_uses_placeholder_drone() {
        let dispatch = NewDispatch::assigned(42);
        assert_eq!(dispatch.order_id, 42);
        assert_eq!(dispatch.drone_id, PLACEHOLDER_DRONE_ID);
        assert_eq!(dispatch.status, DispatchStatus::Assigned);
    }

    #[test]
    fn test_status_round_trips_through_store_name() {
        for status in [
            DispatchStatus::Assigned,
            DispatchStatus::InTransit,
            DispatchStatus::Delivered,
            DispatchStatus::Cancelled,
        ] {
            assert_eq!(DispatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DispatchStatus::parse("Lost"), None);
    }

    #[test]
    fn test_status_serializes_as_name() {
        let json = serde_json::to_string(&DispatchStatus::Assigned).unwrap();
        assert_eq!(json, "\"Assigned\"");
    }
}
