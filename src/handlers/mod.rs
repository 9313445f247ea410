//! Local effect handlers, one per consuming service.

mod base;
mod dispatch_handler;
mod drone_handler;
mod notification_handler;

pub use base::{EventHandler, HandlerError};
pub use dispatch_handler::DispatchHandler;
pub use drone_handler::DroneHandler;
pub use notification_handler::NotificationHandler;
