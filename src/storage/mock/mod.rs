//! Mock storage implementations for testing.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    DedupKey, OutboxEvent, OutboxStatus, OutboxStore, ProcessedEventLedger, Result, StorageError,
};
use crate::saga::{NewOrder, Order, OrderStatus, OrderStore};

/// In-memory outbox.
#[derive(Default)]
pub struct MockOutboxStore {
    rows: RwLock<Vec<OutboxEvent>>,
    fail_on_get: RwLock<bool>,
    fail_on_mark: RwLock<bool>,
    mark_calls: RwLock<Vec<String>>,
}

impl MockOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, event: OutboxEvent) {
        self.rows.write().await.push(event);
    }

    pub async fn set_fail_on_get(&self, fail: bool) {
        *self.fail_on_get.write().await = fail;
    }

    pub async fn set_fail_on_mark(&self, fail: bool) {
        *self.fail_on_mark.write().await = fail;
    }

    pub async fn rows(&self) -> Vec<OutboxEvent> {
        self.rows.read().await.clone()
    }

    /// Ids passed to `mark_published`, in call order, including failed calls.
    pub async fn mark_calls(&self) -> Vec<String> {
        self.mark_calls.read().await.clone()
    }
}

#[async_trait]
impl OutboxStore for MockOutboxStore {
    async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        if *self.fail_on_get.read().await {
            return Err(StorageError::Injected("get_unpublished".to_string()));
        }
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: &str) -> Result<()> {
        self.mark_calls.write().await.push(id.to_string());
        if *self.fail_on_mark.read().await {
            return Err(StorageError::Injected("mark_published".to_string()));
        }
        if let Some(row) = self.rows.write().await.iter_mut().find(|row| row.id == id) {
            row.status = OutboxStatus::Published;
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .count() as u64)
    }
}

/// In-memory processed-events ledger.
#[derive(Default)]
pub struct MockLedger {
    keys: RwLock<HashSet<DedupKey>>,
    fail_on_contains: RwLock<bool>,
    fail_on_record: RwLock<bool>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_contains(&self, fail: bool) {
        *self.fail_on_contains.write().await = fail;
    }

    pub async fn set_fail_on_record(&self, fail: bool) {
        *self.fail_on_record.write().await = fail;
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }
}

#[async_trait]
impl ProcessedEventLedger for MockLedger {
    async fn contains(&self, key: &DedupKey) -> Result<bool> {
        if *self.fail_on_contains.read().await {
            return Err(StorageError::Injected("contains".to_string()));
        }
        Ok(self.keys.read().await.contains(key))
    }

    async fn record(&self, key: &DedupKey) -> Result<bool> {
        if *self.fail_on_record.read().await {
            return Err(StorageError::Injected("record".to_string()));
        }
        Ok(self.keys.write().await.insert(key.clone()))
    }
}

/// In-memory order store. Does not write outbox rows.
#[derive(Default)]
pub struct MockOrderStore {
    orders: RwLock<HashMap<String, Order>>,
    fail_on_create: RwLock<bool>,
    fail_on_cancel: RwLock<bool>,
}

impl MockOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_create(&self, fail: bool) {
        *self.fail_on_create.write().await = fail;
    }

    pub async fn set_fail_on_cancel(&self, fail: bool) {
        *self.fail_on_cancel.write().await = fail;
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl OrderStore for MockOrderStore {
    async fn create_with_event(&self, new_order: &NewOrder) -> Result<Order> {
        if *self.fail_on_create.read().await {
            return Err(StorageError::Injected("create_with_event".to_string()));
        }
        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new_order.user_id.clone(),
            user_email: new_order.user_email.clone(),
            total_price: new_order.total_price,
            status: OrderStatus::Created,
            items: new_order.items.clone(),
            created_at: chrono::Utc::now(),
        };
        self.orders
            .write()
            .await
            .insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel(&self, order_id: &str) -> Result<bool> {
        if *self.fail_on_cancel.read().await {
            return Err(StorageError::Injected("cancel".to_string()));
        }
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?;
        if order.status == OrderStatus::Cancelled {
            return Ok(false);
        }
        order.status = OrderStatus::Cancelled;
        Ok(true)
    }

    async fn get(&self, order_id: &str) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }
}
