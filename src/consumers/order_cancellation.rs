//! Order cancellation on `stock_update_failed`.

use async_trait::async_trait;

use super::{Applied, Atomicity, EffectError, EventEffect};
use crate::context::Context;
use crate::events::{DomainEvent, EventName};
use crate::storage::{DedupKey, SqliteOrderStore};

/// Cancels the order whose stock could not be reserved.
///
/// An unknown order id dead-letters: the order row commits before its
/// `order_created` event exists, so it cannot legitimately be missing.
pub struct OrderCancellation {
    orders: SqliteOrderStore,
}

impl OrderCancellation {
    pub fn new(orders: SqliteOrderStore) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl EventEffect for OrderCancellation {
    fn name(&self) -> &'static str {
        "order_cancellation"
    }

    fn accepts(&self, event: EventName) -> bool {
        event == EventName::StockUpdateFailed
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
        let DomainEvent::StockUpdateFailed(failed) = event else {
            return Err(EffectError::Unsupported(event.name()));
        };
        let key = key.cloned().unwrap_or_else(|| {
            DedupKey::new(failed.order_id.as_str(), EventName::StockUpdateFailed)
        });

        if self.orders.cancel_for_event(&key, &failed.order_id).await? {
            Ok(Applied::Done)
        } else {
            Ok(Applied::Duplicate)
        }
    }
}
