//! Core types for the order event services.

mod config;
mod dispatch;
mod event;
mod order;

pub use config::{ConfigError, LogFormat, PublishFailurePolicy, ServiceConfig, ServiceRole};
pub use dispatch::{DispatchRecord, DispatchStatus, NewDispatch, PLACEHOLDER_DRONE_ID};
pub use event::OrderCreatedEvent;
pub use order::{NewOrder, OrderRecord};
