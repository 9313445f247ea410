//! Order Events Library
//!
//! Distributes order-created events from the order service to the dispatch,
//! drone and notification services over a fanout exchange, with supervised
//! connections and a retry-then-dead-letter consumer.

pub mod api;
pub mod handlers;
pub mod logging;
pub mod messaging;
pub mod orders;
pub mod services;
pub mod store;
pub mod types;

pub use handlers::{DispatchHandler, DroneHandler, EventHandler, HandlerError, NotificationHandler};
pub use messaging::{
    ConnectionSupervisor, EventConsumer, EventPublisher, MessagingError, TopologyManager,
    DISPATCH_QUEUE, ORDER_EVENTS_EXCHANGE,
};
pub use orders::{OrderPlacement, PlacedOrder, PlacementError};
pub use services::{Service, ServiceError};
pub use types::{OrderCreatedEvent, ServiceConfig, ServiceRole};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::handlers::*;
    pub use crate::messaging::*;
    pub use crate::types::*;
}
