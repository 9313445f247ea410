//! Backing-store seam.
//!
//! Handlers and the order call-point depend on these traits only. The
//! PostgreSQL implementation backs real deployments; the in-memory one backs
//! tests and `DATABASE_URL=memory://` runs. [`DeferredStore`] stands in for
//! either while the connection is still being established.

mod deferred;
mod memory;
mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DispatchRecord, NewDispatch, NewOrder, OrderRecord};

pub use deferred::{DeferredStore, StoreHandle};
pub use memory::MemoryStore;
pub use postgres::{PgConnector, PgStore};

/// Errors raised by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => !matches!(
                e,
                sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::Decode(_)
            ),
            StoreError::Unavailable(_) => true,
            StoreError::InvalidRow(_) => false,
        }
    }
}

/// Dispatch records owned by the dispatch service.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// Insert one record and return it with its generated identifier.
    async fn insert_dispatch(&self, dispatch: &NewDispatch) -> Result<DispatchRecord, StoreError>;

    /// All dispatch records referencing an order, oldest first.
    async fn find_by_order(&self, order_id: i64) -> Result<Vec<DispatchRecord>, StoreError>;
}

/// Orders owned by the order service.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Commit one order and return it with its generated identifier.
    async fn insert_order(&self, order: &NewOrder) -> Result<OrderRecord, StoreError>;
}
