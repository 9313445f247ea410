use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::{DispatchStore, OrderStore, StoreError};
use crate::types::{DispatchRecord, NewDispatch, NewOrder, OrderRecord};

/// Store handles shared by every handler in the process.
#[derive(Clone)]
pub struct StoreHandle {
    pub dispatches: Arc<dyn DispatchStore>,
    pub orders: Arc<dyn OrderStore>,
}

/// A store that is connected after the service has started.
///
/// Until [`fill`](Self::fill) is called every operation fails with the
/// transient [`StoreError::Unavailable`], so consumers requeue instead of
/// dead-lettering.
#[derive(Clone, Default)]
pub struct DeferredStore {
    cell: Arc<OnceCell<StoreHandle>>,
}

impl DeferredStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the connected store. Returns `false` if one was already set.
    pub fn fill(&self, handle: StoreHandle) -> bool {
        self.cell.set(handle).is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }

    fn get(&self) -> Result<&StoreHandle, StoreError> {
        self.cell
            .get()
            .ok_or_else(|| StoreError::Unavailable("store not connected yet".to_string()))
    }
}

#[async_trait]
impl DispatchStore for DeferredStore {
    async fn insert_dispatch(&self, dispatch: &NewDispatch) -> Result<DispatchRecord, StoreError> {
        self.get()?.dispatches.insert_dispatch(dispatch).await
    }

    async fn find_by_order(&self, order_id: i64) -> Result<Vec<DispatchRecord>, StoreError> {
        self.get()?.dispatches.find_by_order(order_id).await
    }
}

#[async_trait]
impl OrderStore for DeferredStore {
    async fn insert_order(&self, order: &NewOrder) -> Result<OrderRecord, StoreError> {
        self.get()?.orders.insert_order(order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::DispatchStatus;
    use pretty_assertions::assert_eq;

    fn handle(store: &MemoryStore) -> StoreHandle {
        let store = Arc::new(store.clone());
        StoreHandle {
            dispatches: store.clone(),
            orders: store,
        }
    }

    #[tokio::test]
    async fn test_unfilled_store_is_transiently_unavailable() {
        let deferred = DeferredStore::new();
        let err = deferred
            .insert_dispatch(&NewDispatch {
                order_id: 1,
                drone_id: 1,
                status: DispatchStatus::Assigned,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_transient());
        assert!(!deferred.is_ready());
    }

    #[tokio::test]
    async fn test_filled_store_delegates() {
        let memory = MemoryStore::new();
        let deferred = DeferredStore::new();
        let shared = deferred.clone();

        assert!(deferred.fill(handle(&memory)));
        assert!(!deferred.fill(handle(&memory)));
        assert!(shared.is_ready());

        shared
            .insert_dispatch(&NewDispatch {
                order_id: 5,
                drone_id: 1,
                status: DispatchStatus::Assigned,
            })
            .await
            .unwrap();
        assert_eq!(memory.dispatches().len(), 1);
        assert_eq!(shared.find_by_order(5).await.unwrap().len(), 1);
    }
}
