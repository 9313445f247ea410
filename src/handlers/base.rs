//! Base trait for local effect handlers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::store::StoreError;

/// Why a handler could not apply its effect.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Store write failed: {0}")]
    Store(#[from] StoreError),

    /// The event can never be processed; retrying is pointless.
    #[error("Event rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// Whether running the handler again could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            HandlerError::Store(e) => e.is_transient(),
            HandlerError::Rejected(_) => false,
        }
    }
}

/// Per-consumer business logic invoked once per decoded event.
///
/// Handlers may run concurrently and may see the same event more than once
/// (delivery is at-least-once).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Payload shape this handler expects on the wire.
    type Event: DeserializeOwned + Send + Sync;

    /// Short name used in logs, consumer tags and dead-letter routing.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Self::Event) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_permanent() {
        assert!(!HandlerError::Rejected("negative order id".into()).is_transient());
        assert!(HandlerError::Store(StoreError::Unavailable("down".into())).is_transient());
        assert!(!HandlerError::Store(StoreError::InvalidRow("bad".into())).is_transient());
    }
}
