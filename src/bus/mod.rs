//! Message broker client.
//!
//! This module contains:
//! - `Broker` trait: durable publish and subscribe-with-handler
//! - `DeliveryHandler` trait: per-delivery processing returning a `Disposition`
//! - Topology naming (`<exchange>.dlx`, `<queue>.dlq`)
//! - Broker configuration and factory
//! - Implementations: AMQP (RabbitMQ), in-process channel broker

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::context::Context;
use crate::events::EventName;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod dispatch;
pub mod reconnect;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use channel::ChannelBroker;
pub use dispatch::dispatch;
pub use reconnect::ReconnectPolicy;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    /// Rejected topology request (permissions, conflicting declarations).
    #[error("Topology rejected: {0}")]
    Topology(String),

    #[error("Gave up reconnecting after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: usize, last: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Transient errors are retried by the nearest retry loop; the rest are
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Publish(_))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// AMQP exchange types used by the services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
        }
    }
}

/// An outbound message. Always published persistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Stable identifier (outbox row id) so consumers can tell deliveries apart.
    pub message_id: Option<String>,
}

impl Publication {
    pub fn new(
        exchange: impl Into<String>,
        kind: ExchangeKind,
        routing_key: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            routing_key: routing_key.into(),
            body,
            message_id: None,
        }
    }

    /// Publication for a domain event on its conventional exchange.
    pub fn for_event(event: EventName, body: Vec<u8>) -> Self {
        Self::new(event.exchange(), ExchangeKind::Direct, event.as_str(), body)
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

/// Terminal outcome a consumer chooses for every delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed (or already processed): discard.
    Ack,
    /// Transient failure: put back on the queue for redelivery.
    Requeue,
    /// Permanent failure: reject without requeue, routing to the dead-letter queue.
    DeadLetter,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Ack => f.write_str("ack"),
            Disposition::Requeue => f.write_str("nack-requeue"),
            Disposition::DeadLetter => f.write_str("nack-no-requeue"),
        }
    }
}

// ============================================================================
// Topology
// ============================================================================

/// Everything a consumer declares on (re)connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: String,
    pub consumer_tag: String,
    pub binding_key: String,
}

impl Subscription {
    /// Subscription of service `domain` to `event` using the naming convention:
    /// exchange `<event>_exchange`, queue `<domain>_queue`,
    /// consumer tag `<domain>_<event>_consumer`.
    pub fn for_event(domain: &str, event: EventName) -> Self {
        Self {
            exchange: event.exchange(),
            kind: ExchangeKind::Direct,
            queue: format!("{}_queue", domain),
            consumer_tag: format!("{}_{}_consumer", domain, event.as_str()),
            binding_key: event.as_str().to_string(),
        }
    }

    /// Override the queue name. A queue carries a single dead-letter
    /// exchange, so a role consuming several exchanges needs one queue each.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn dead_letter_exchange(&self) -> String {
        dead_letter_exchange(&self.exchange)
    }

    pub fn dead_letter_queue(&self) -> String {
        dead_letter_queue(&self.queue)
    }
}

/// `<exchange>.dlx`
pub fn dead_letter_exchange(exchange: &str) -> String {
    format!("{}.dlx", exchange)
}

/// `<queue>.dlq`
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

// ============================================================================
// Traits
// ============================================================================

/// Processes one delivery and decides its disposition.
///
/// Handlers run on their own task under a deadline; panics and deadline
/// overruns are mapped to a disposition by [`dispatch`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Disposition;
}

/// Durable publish/subscribe transport.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: in-process broker for tests and single-process runs
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the exchange and publish persistently.
    ///
    /// Transient failures are retried within a fixed budget, then surfaced.
    async fn publish(&self, ctx: &Context, publication: Publication) -> Result<()>;

    /// Declare topology and consume until `ctx` is cancelled.
    ///
    /// Reconnects with backoff on connection loss, re-declaring all topology.
    /// Returns `Ok(())` on cancellation, an error when reconnection is
    /// exhausted or the broker rejects the topology.
    async fn subscribe(
        &self,
        ctx: &Context,
        subscription: Subscription,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-process channel broker (no external broker).
    Channel,
}

/// Publish retry budget: linear backoff between attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishRetryConfig {
    /// Total attempts including the first.
    pub attempts: usize,
    /// Delay step; attempt N waits N * step.
    pub backoff_ms: u64,
}

impl Default for PublishRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Reconnection backoff bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub floor_ms: u64,
    pub ceiling_ms: u64,
    pub max_attempts: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            floor_ms: 1_000,
            ceiling_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        ReconnectPolicy {
            floor: Duration::from_millis(config.floor_ms),
            ceiling: Duration::from_millis(config.ceiling_ms),
            max_attempts: config.max_attempts,
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// AMQP connection URL.
    pub url: String,
    /// Unacknowledged deliveries allowed per consumer.
    pub prefetch: u16,
    /// Deadline for a single handler invocation.
    pub handler_timeout_secs: u64,
    pub publish: PublishRetryConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Amqp,
            url: "amqp://localhost:5672".to_string(),
            prefetch: 10,
            handler_timeout_secs: 30,
            publish: PublishRetryConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from(&self.reconnect)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker selected by configuration.
///
/// The AMQP broker connects lazily, so this never blocks on the network.
pub fn init_broker(
    config: &BrokerConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type {
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::new(config.clone());
                info!(broker_type = "amqp", url = %config.url, "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
        BrokerType::Channel => {
            let broker = ChannelBroker::new(channel::ChannelBrokerConfig::from(config));
            info!(broker_type = "channel", "Broker initialized");
            Ok(Arc::new(broker))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_naming_convention() {
        let sub = Subscription::for_event("product", EventName::OrderCreated);
        assert_eq!(sub.exchange, "order_created_exchange");
        assert_eq!(sub.queue, "product_queue");
        assert_eq!(sub.consumer_tag, "product_order_created_consumer");
        assert_eq!(sub.binding_key, "order_created");
        assert_eq!(sub.dead_letter_exchange(), "order_created_exchange.dlx");
        assert_eq!(sub.dead_letter_queue(), "product_queue.dlq");
    }

    #[test]
    fn test_publication_for_event() {
        let publication = Publication::for_event(EventName::StockUpdateFailed, b"{}".to_vec())
            .with_message_id("row-1");
        assert_eq!(publication.exchange, "stock_update_failed_exchange");
        assert_eq!(publication.routing_key, "stock_update_failed");
        assert_eq!(publication.kind, ExchangeKind::Direct);
        assert_eq!(publication.message_id.as_deref(), Some("row-1"));
    }

    #[test]
    fn test_error_classification() {
        assert!(BrokerError::Connection("reset".into()).is_transient());
        assert!(BrokerError::Publish("nack".into()).is_transient());
        assert!(!BrokerError::Topology("ACCESS_REFUSED".into()).is_transient());
        assert!(!BrokerError::Cancelled.is_transient());
        assert!(!BrokerError::ReconnectExhausted {
            attempts: 3,
            last: "refused".into()
        }
        .is_transient());
    }

    #[test]
    fn test_broker_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.broker_type, BrokerType::Amqp);
        assert_eq!(config.url, "amqp://localhost:5672");
        assert_eq!(config.handler_timeout(), Duration::from_secs(30));
        let policy = config.reconnect_policy();
        assert_eq!(policy.floor, Duration::from_secs(1));
        assert_eq!(policy.ceiling, Duration::from_secs(30));
    }

    #[test]
    fn test_init_channel_broker() {
        let config = BrokerConfig {
            broker_type: BrokerType::Channel,
            ..Default::default()
        };
        assert!(init_broker(&config).is_ok());
    }
}
