//! Search indexing on product events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Applied, Atomicity, EffectError, EventEffect};
use crate::bus::Delivery;
use crate::context::Context;
use crate::events::{DomainEvent, EventName, ProductEvent};
use crate::storage::DedupKey;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Search backend unavailable: {0}")]
    Unavailable(String),

    #[error("Document rejected: {0}")]
    Rejected(String),
}

impl From<IndexError> for EffectError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unavailable(_) => EffectError::Transient(err.to_string()),
            IndexError::Rejected(_) => EffectError::Invariant(err.to_string()),
        }
    }
}

/// Product search backend.
///
/// Writes carry `ProductEvent::version`. A write at or below the newest
/// version already seen for the product, removals included, is stale and
/// ignored, so events arriving out of order across queues converge.
/// Returns whether the index changed.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the document for `product.id`.
    async fn upsert(&self, product: &ProductEvent) -> Result<bool, IndexError>;

    /// Remove the document for `product.id`. Removing a missing document
    /// succeeds.
    async fn remove(&self, product: &ProductEvent) -> Result<bool, IndexError>;
}

/// Index held in memory.
#[derive(Default)]
pub struct InMemorySearchIndex {
    documents: RwLock<HashMap<String, ProductEvent>>,
    /// Newest version seen per product, kept after removal.
    versions: RwLock<HashMap<String, i64>>,
    writes: RwLock<usize>,
    unavailable: RwLock<bool>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    pub async fn get(&self, product_id: &str) -> Option<ProductEvent> {
        self.documents.read().await.get(product_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Successful upserts and removals.
    pub async fn writes(&self) -> usize {
        *self.writes.read().await
    }

    async fn check_available(&self) -> Result<(), IndexError> {
        if *self.unavailable.read().await {
            return Err(IndexError::Unavailable("index offline".to_string()));
        }
        Ok(())
    }

    /// Record `product.version` unless an equal or newer one was seen.
    /// Unversioned writes always apply.
    async fn advance(&self, product: &ProductEvent) -> bool {
        if product.version <= 0 {
            return true;
        }
        let mut versions = self.versions.write().await;
        if matches!(versions.get(&product.id), Some(seen) if *seen >= product.version) {
            return false;
        }
        versions.insert(product.id.clone(), product.version);
        true
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, product: &ProductEvent) -> Result<bool, IndexError> {
        self.check_available().await?;
        if product.id.is_empty() {
            return Err(IndexError::Rejected("document without id".to_string()));
        }
        if !self.advance(product).await {
            return Ok(false);
        }
        self.documents
            .write()
            .await
            .insert(product.id.clone(), product.clone());
        *self.writes.write().await += 1;
        Ok(true)
    }

    async fn remove(&self, product: &ProductEvent) -> Result<bool, IndexError> {
        self.check_available().await?;
        if !self.advance(product).await {
            return Ok(false);
        }
        self.documents.write().await.remove(&product.id);
        *self.writes.write().await += 1;
        Ok(true)
    }
}

/// Keeps the search index in step with the product catalogue.
///
/// One product emits many events under the same aggregate id, so
/// deliveries are deduplicated by message id instead. Deliveries without a
/// message id are applied unconditionally; upserts and removals converge.
///
/// Created, updated and deleted events arrive on separate queues with no
/// ordering between them. The index drops writes older than the product's
/// newest version, so a late update cannot bring back a deleted product.
pub struct SearchIndexing {
    index: Arc<dyn SearchIndex>,
}

impl SearchIndexing {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl EventEffect for SearchIndexing {
    fn name(&self) -> &'static str {
        "search_indexing"
    }

    fn accepts(&self, event: EventName) -> bool {
        matches!(
            event,
            EventName::ProductCreated | EventName::ProductUpdated | EventName::ProductDeleted
        )
    }

    fn atomicity(&self) -> Atomicity {
        Atomicity::BestEffort
    }

    fn dedup_key(&self, event: &DomainEvent, delivery: &Delivery) -> Option<DedupKey> {
        delivery
            .message_id
            .as_deref()
            .map(|id| DedupKey::new(id, event.name()))
    }

    async fn apply(
        &self,
        _ctx: &Context,
        _key: Option<&DedupKey>,
        event: &DomainEvent,
    ) -> Result<Applied, EffectError> {
        match event {
            DomainEvent::ProductCreated(product) | DomainEvent::ProductUpdated(product) => {
                if self.index.upsert(product).await? {
                    debug!(product_id = %product.id, version = product.version, "Product indexed");
                } else {
                    debug!(product_id = %product.id, version = product.version, "Stale product event skipped");
                }
            }
            DomainEvent::ProductDeleted(product) => {
                if self.index.remove(product).await? {
                    debug!(product_id = %product.id, version = product.version, "Product removed from index");
                } else {
                    debug!(product_id = %product.id, version = product.version, "Stale product removal skipped");
                }
            }
            other => return Err(EffectError::Unsupported(other.name())),
        }
        Ok(Applied::Done)
    }
}
