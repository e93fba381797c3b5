//! Stock decrement on `order_created`.

use async_trait::async_trait;
use tracing::warn;

use super::{Applied, Atomicity, EffectError, EventEffect};
use crate::context::Context;
use crate::events::{DomainEvent, EventName};
use crate::storage::sqlite::StockOutcome;
use crate::storage::{DedupKey, SqliteProductStore};

/// Decrements stock for every ordered line, all or nothing.
///
/// A shortfall commits a `stock_update_failed` event for the order service
/// and dead-letters the delivery.
pub struct StockDecrement {
    products: SqliteProductStore,
}

impl StockDecrement {
    pub fn new(products: SqliteProductStore) -> Self {
        Self { products }
    }
}

#[async_trait]
impl EventEffect for StockDecrement {
    fn name(&self) -> &'static str {
        "stock_decrement"
    }

    fn accepts(&self, event: EventName) -> bool {
        event == EventName::OrderCreated
    }

    fn atomicity(&self) -> Atomicity {
        Atomicity::Transactional
    }

    async fn apply(
        &self,
        _ctx: &Context,
        key: Option<&DedupKey>,
        event: &DomainEvent,
    ) -> Result<Applied, EffectError> {
        let DomainEvent::OrderCreated(order) = event else {
            return Err(EffectError::Unsupported(event.name()));
        };
        let key = key
            .cloned()
            .unwrap_or_else(|| DedupKey::new(order.order_id.as_str(), EventName::OrderCreated));

        match self.products.apply_order(&key, order).await? {
            StockOutcome::Applied => Ok(Applied::Done),
            StockOutcome::Duplicate => Ok(Applied::Duplicate),
            StockOutcome::Shortfall { expected, affected } => {
                warn!(
                    order_id = %order.order_id,
                    expected,
                    affected,
                    "Stock update failed, compensation emitted"
                );
                Err(EffectError::Invariant(format!(
                    "order {} updated {} of {} products",
                    order.order_id, affected, expected
                )))
            }
        }
    }
}
