//! Idempotent event consumers.
//!
//! [`IdempotentConsumer`] turns at-least-once delivery into at-most-once
//! effects. Per delivery:
//!
//! 1. decode by routing key; failure → dead-letter
//! 2. look the dedup key up in the ledger; present → ack, lookup error → requeue
//! 3. apply the effect. Transactional effects record the key in their own
//!    transaction; best-effort effects have it recorded after they succeed
//! 4. ack on success, requeue on transient failure, dead-letter on an
//!    invariant violation
//!
//! Effects are instantiated per role by [`bindings_for`].

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, BrokerError, Delivery, DeliveryHandler, Disposition, Subscription};
use crate::config::ServiceRole;
use crate::context::Context;
use crate::events::{DomainEvent, EventName, EventRegistry};
use crate::storage::{
    DedupKey, ProcessedEventLedger, SqliteCartStore, SqliteLedger, SqliteOrderStore,
    SqliteProductStore, StorageError,
};

pub mod cart;
pub mod notification;
pub mod order_cancellation;
pub mod search;
pub mod stock;

pub use cart::CartClearing;
pub use notification::{Email, LogMailer, MailError, Mailer, OrderConfirmation, RecordingMailer};
pub use order_cancellation::OrderCancellation;
pub use search::{InMemorySearchIndex, IndexError, SearchIndex, SearchIndexing};
pub use stock::StockDecrement;

/// Whether an effect can record its dedup key atomically with itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomicity {
    /// Effect and ledger row commit in one local transaction.
    Transactional,
    /// External side effect; the key is recorded after it succeeds and a
    /// crash in between repeats the effect on redelivery.
    BestEffort,
}

/// Successful effect outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    /// A concurrent or earlier delivery already applied it.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    /// Retrying later may succeed.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Data inconsistency that redelivery cannot fix.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Unsupported event: {0}")]
    Unsupported(EventName),
}

impl From<StorageError> for EffectError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            EffectError::Transient(err.to_string())
        } else {
            EffectError::Invariant(err.to_string())
        }
    }
}

/// A local effect driven by an inbound event.
#[async_trait]
pub trait EventEffect: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn accepts(&self, event: EventName) -> bool;

    fn atomicity(&self) -> Atomicity;

    /// Identity used for deduplication; `None` disables it for this delivery.
    fn dedup_key(&self, event: &DomainEvent, _delivery: &Delivery) -> Option<DedupKey> {
        Some(DedupKey::new(event.aggregate_id(), event.name()))
    }

    /// Apply the effect. Transactional effects must record `key` in the
    /// same transaction and report `Duplicate` if it was already present.
    async fn apply(
        &self,
        ctx: &Context,
        key: Option<&DedupKey>,
        event: &DomainEvent,
    ) -> Result<Applied, EffectError>;
}

/// Ledger-guarded [`DeliveryHandler`] around one effect.
pub struct IdempotentConsumer<E> {
    effect: E,
    ledger: Arc<dyn ProcessedEventLedger>,
    registry: Arc<EventRegistry>,
}

impl<E: EventEffect> IdempotentConsumer<E> {
    pub fn new(effect: E, ledger: Arc<dyn ProcessedEventLedger>) -> Self {
        Self {
            effect,
            ledger,
            registry: Arc::new(EventRegistry::default()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<EventRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn effect(&self) -> &E {
        &self.effect
    }
}

#[async_trait]
impl<E: EventEffect> DeliveryHandler for IdempotentConsumer<E> {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Disposition {
        let consumer = self.effect.name();

        let event = match self.registry.decode(&delivery.routing_key, &delivery.body) {
            Ok(event) => event,
            Err(e) => {
                error!(consumer, routing_key = %delivery.routing_key, error = %e, "Undecodable delivery, dead-lettering");
                return Disposition::DeadLetter;
            }
        };
        if !self.effect.accepts(event.name()) {
            error!(consumer, event_name = %event.name(), "Event not handled by this consumer, dead-lettering");
            return Disposition::DeadLetter;
        }

        let key = self.effect.dedup_key(&event, delivery);
        if let Some(key) = &key {
            match self.ledger.contains(key).await {
                Ok(true) => {
                    debug!(consumer, key = %key, "Already processed, acking");
                    return Disposition::Ack;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(consumer, key = %key, error = %e, "Ledger lookup failed, requeueing");
                    return Disposition::Requeue;
                }
            }
        }

        if let Err(e) = ctx.check() {
            warn!(consumer, error = %e, "Context ended before apply, requeueing");
            return Disposition::Requeue;
        }

        match self.effect.apply(ctx, key.as_ref(), &event).await {
            Ok(Applied::Duplicate) => {
                debug!(consumer, aggregate_id = %event.aggregate_id(), "Duplicate lost the race, acking");
                Disposition::Ack
            }
            Ok(Applied::Done) => {
                if let (Atomicity::BestEffort, Some(key)) = (self.effect.atomicity(), &key) {
                    if let Err(e) = self.ledger.record(key).await {
                        // The effect already happened; requeueing would repeat it.
                        warn!(consumer, key = %key, error = %e, "Failed to record processed event");
                    }
                }
                info!(consumer, event_name = %event.name(), aggregate_id = %event.aggregate_id(), "Event applied");
                Disposition::Ack
            }
            Err(EffectError::Transient(reason)) => {
                warn!(consumer, aggregate_id = %event.aggregate_id(), reason = %reason, "Transient failure, requeueing");
                Disposition::Requeue
            }
            Err(e) => {
                error!(consumer, aggregate_id = %event.aggregate_id(), error = %e, "Permanent failure, dead-lettering");
                Disposition::DeadLetter
            }
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// A subscription together with the handler serving it.
pub struct ConsumerBinding {
    pub subscription: Subscription,
    pub handler: Arc<dyn DeliveryHandler>,
}

/// Collaborators the consumers of a role need.
#[derive(Clone)]
pub struct ConsumerDeps {
    /// The role's own database: business tables plus ledger.
    pub pool: SqlitePool,
    pub search_index: Arc<dyn SearchIndex>,
    pub mailer: Arc<dyn Mailer>,
}

/// Subscriptions a role consumes.
///
/// Search reads three product exchanges and so uses one queue per event:
/// a queue has a single dead-letter exchange.
pub fn subscriptions_for(role: ServiceRole) -> Vec<Subscription> {
    let domain = role.as_str();
    match role {
        ServiceRole::Product | ServiceRole::Cart | ServiceRole::Notification => {
            vec![Subscription::for_event(domain, EventName::OrderCreated)]
        }
        ServiceRole::Order => vec![Subscription::for_event(domain, EventName::StockUpdateFailed)],
        ServiceRole::Search => [
            EventName::ProductCreated,
            EventName::ProductUpdated,
            EventName::ProductDeleted,
        ]
        .into_iter()
        .map(|event| {
            Subscription::for_event(domain, event)
                .with_queue(format!("{}_{}_queue", domain, event.as_str()))
        })
        .collect(),
    }
}

/// Subscriptions and handlers for `role`.
pub fn bindings_for(role: ServiceRole, deps: &ConsumerDeps) -> Vec<ConsumerBinding> {
    let ledger: Arc<dyn ProcessedEventLedger> = Arc::new(SqliteLedger::new(deps.pool.clone()));

    let handler: Arc<dyn DeliveryHandler> = match role {
        ServiceRole::Product => Arc::new(IdempotentConsumer::new(
            StockDecrement::new(SqliteProductStore::new(deps.pool.clone())),
            ledger,
        )),
        ServiceRole::Cart => Arc::new(IdempotentConsumer::new(
            CartClearing::new(SqliteCartStore::new(deps.pool.clone())),
            ledger,
        )),
        ServiceRole::Order => Arc::new(IdempotentConsumer::new(
            OrderCancellation::new(SqliteOrderStore::new(deps.pool.clone())),
            ledger,
        )),
        ServiceRole::Search => Arc::new(IdempotentConsumer::new(
            SearchIndexing::new(deps.search_index.clone()),
            ledger,
        )),
        ServiceRole::Notification => Arc::new(IdempotentConsumer::new(
            OrderConfirmation::new(deps.mailer.clone()),
            ledger,
        )),
    };

    subscriptions_for(role)
        .into_iter()
        .map(|subscription| ConsumerBinding {
            subscription,
            handler: handler.clone(),
        })
        .collect()
}

/// Subscribe every binding and wait until all of them return.
///
/// The first error cancels the remaining subscriptions and is returned.
pub async fn run_consumers(
    ctx: &Context,
    broker: Arc<dyn Broker>,
    bindings: Vec<ConsumerBinding>,
) -> Result<(), BrokerError> {
    let ctx = ctx.child();
    let mut subscriptions = JoinSet::new();
    for binding in bindings {
        let broker = broker.clone();
        let ctx = ctx.clone();
        subscriptions.spawn(async move {
            let queue = binding.subscription.queue.clone();
            let result = broker
                .subscribe(&ctx, binding.subscription, binding.handler)
                .await;
            (queue, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = subscriptions.join_next().await {
        let failure = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((queue, Err(e))) => {
                error!(queue = %queue, error = %e, "Subscription ended with error");
                e
            }
            Err(e) => {
                error!(error = %e, "Subscription task failed");
                BrokerError::Connection(e.to_string())
            }
        };
        if first_error.is_none() {
            ctx.cancel();
            first_error = Some(failure);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
