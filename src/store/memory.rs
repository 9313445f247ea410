//! In-process store with failure injection.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{DispatchStore, OrderStore, StoreError};
use crate::messaging::{Connector, MessagingError};
use crate::types::{DispatchRecord, NewDispatch, NewOrder, OrderRecord};

#[derive(Default)]
struct Tables {
    orders: Vec<OrderRecord>,
    dispatches: Vec<DispatchRecord>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    /// Number of upcoming writes that fail
    failing_writes: AtomicU32,
    unavailable: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

/// Orders and dispatches held in memory. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Refuse connections and writes until set back to available.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every write, simulating a hung database.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.inner.write_delay.lock() = delay;
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.inner.tables.lock().dispatches.clone()
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.inner.tables.lock().orders.clone()
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        let delay = *self.inner.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        let injected = self
            .inner
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryStore {
    type Connection = MemoryStore;

    fn target(&self) -> String {
        "memory://".to_string()
    }

    async fn connect(&self) -> Result<MemoryStore, MessagingError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(MessagingError::connection(self.target(), "store is offline"));
        }
        Ok(self.clone())
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn insert_dispatch(&self, dispatch: &NewDispatch) -> Result<DispatchRecord, StoreError> {
        self.before_write().await?;
        let mut tables = self.inner.tables.lock();
        let record = DispatchRecord {
            dispatch_id: tables.dispatches.len() as i64 + 1,
            order_id: dispatch.order_id,
            drone_id: dispatch.drone_id,
            status: dispatch.status,
            created_at: Utc::now(),
        };
        tables.dispatches.push(record.clone());
        Ok(record)
    }

    async fn find_by_order(&self, order_id: i64) -> Result<Vec<DispatchRecord>, StoreError> {
        Ok(self
            .inner
            .tables
            .lock()
            .dispatches
            .iter()
            .filter(|d| d.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &NewOrder) -> Result<OrderRecord, StoreError> {
        self.before_write().await?;
        let mut tables = self.inner.tables.lock();
        let record = OrderRecord {
            order_id: tables.orders.len() as i64 + 1,
            user_id: order.user_id,
            restaurant_id: order.restaurant_id,
            total_amount: order.total_amount,
            created_at: Utc::now(),
        };
        tables.orders.push(record.clone());
        Ok(record)
    }
}
