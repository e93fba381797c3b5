//! Cart clearing on `order_created`.

use async_trait::async_trait;

use super::{Applied, Atomicity, EffectError, EventEffect};
use crate::context::Context;
use crate::events::{DomainEvent, EventName};
use crate::storage::{DedupKey, SqliteCartStore};

pub struct CartClearing {
    carts: SqliteCartStore,
}

impl CartClearing {
    pub fn new(carts: SqliteCartStore) -> Self {
        Self { carts }
    }
}

#[async_trait]
impl EventEffect for CartClearing {
    fn name(&self) -> &'static str {
        "cart_clearing"
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

        if self.carts.clear_for_order(&key, &order.user_id).await? {
            Ok(Applied::Done)
        } else {
            Ok(Applied::Duplicate)
        }
    }
}
