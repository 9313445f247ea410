//! Messaging error types.

use thiserror::Error;

/// Errors raised by the event distribution core.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Could not connect to {target} after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("Topology conflict on {entity} '{name}': {reason}")]
    TopologyConflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    #[error("Publish to exchange '{exchange}' failed: {message}")]
    PublishFailure { exchange: String, message: String },

    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("Handler '{handler}' failed: {message}")]
    HandlerFailure { handler: String, message: String },

    #[error("Delivery {delivery_tag} was already acknowledged or rejected")]
    AlreadySettled { delivery_tag: u64 },

    #[error("Broker operation {operation} failed: {message}")]
    Broker { operation: String, message: String },

    #[error("Not found: {entity} '{name}'")]
    NotFound { entity: &'static str, name: String },

    #[error("Resource locked: {entity} '{name}' is owned by another connection")]
    ResourceLocked { entity: &'static str, name: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Message serialization error: {message}")]
    Serialization { message: String },
}

impl MessagingError {
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn topology_conflict(
        entity: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TopologyConflict {
            entity,
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn publish_failure(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PublishFailure {
            exchange: exchange.into(),
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn broker(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            name: name.into(),
        }
    }

    /// Whether the owning service instance must stop taking new work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionExhausted { .. } | Self::TopologyConflict { .. }
        )
    }

    /// Whether the error only concerns the message being processed.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage { .. } | Self::HandlerFailure { .. } | Self::AlreadySettled { .. }
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        Self::broker("amqp", err.to_string())
    }
}
