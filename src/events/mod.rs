//! Event contracts shared between services.
//!
//! Payloads are JSON with camelCase field names; several services decode the
//! same event, so field names are part of the wire contract and must not drift.
//!
//! Event kinds are an explicit enum ([`EventName`]) and decoding goes through
//! the [`EventRegistry`], which maps a name to its decoder and yields a
//! [`DomainEvent`] sum type.

mod registry;

pub use registry::{DecodeError, EventRegistry};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical event names. The string form doubles as outbox `event_name`,
/// AMQP routing key and exchange stem (`<name>_exchange`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    OrderCreated,
    StockUpdateFailed,
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
}

impl EventName {
    pub const ALL: [EventName; 5] = [
        EventName::OrderCreated,
        EventName::StockUpdateFailed,
        EventName::ProductCreated,
        EventName::ProductUpdated,
        EventName::ProductDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::OrderCreated => "order_created",
            EventName::StockUpdateFailed => "stock_update_failed",
            EventName::ProductCreated => "product_created",
            EventName::ProductUpdated => "product_updated",
            EventName::ProductDeleted => "product_deleted",
        }
    }

    /// Exchange carrying this event: `<domain>_<event>_exchange`.
    pub fn exchange(&self) -> String {
        exchange_for(self.as_str())
    }
}

/// Exchange name for a raw event name, used by the relay for rows whose name
/// it does not need to interpret.
pub fn exchange_for(event_name: &str) -> String {
    format!("{}_exchange", event_name)
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownEvent(s.to_string()))
    }
}

/// A product and the quantity ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductQuantity {
    pub product_id: String,
    pub quantity: i64,
}

/// Emitted by the order service when an order row is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub user_id: String,
    pub user_email: String,
    pub products: Vec<ProductQuantity>,
}

/// Compensating event emitted by the product service when an order's stock
/// could not be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockUpdateFailed {
    pub order_id: String,
    pub products: Vec<ProductQuantity>,
}

/// Product snapshot carried by product created/updated/deleted events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductEvent {
    pub id: String,
    pub category_id: String,
    pub name: String,
    pub description: String,
    /// Decimal price rendered as a string to avoid float rounding on the wire.
    pub price: String,
    pub stock_quantity: i64,
    /// Increases with every catalogue change of the product, deletion
    /// included. Zero when the producer does not version its events.
    #[serde(default)]
    pub version: i64,
}

/// Decoded event, one variant per [`EventName`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    OrderCreated(OrderCreated),
    StockUpdateFailed(StockUpdateFailed),
    ProductCreated(ProductEvent),
    ProductUpdated(ProductEvent),
    ProductDeleted(ProductEvent),
}

impl DomainEvent {
    pub fn name(&self) -> EventName {
        match self {
            DomainEvent::OrderCreated(_) => EventName::OrderCreated,
            DomainEvent::StockUpdateFailed(_) => EventName::StockUpdateFailed,
            DomainEvent::ProductCreated(_) => EventName::ProductCreated,
            DomainEvent::ProductUpdated(_) => EventName::ProductUpdated,
            DomainEvent::ProductDeleted(_) => EventName::ProductDeleted,
        }
    }

    /// The business entity this event concerns.
    pub fn aggregate_id(&self) -> &str {
        match self {
            DomainEvent::OrderCreated(e) => &e.order_id,
            DomainEvent::StockUpdateFailed(e) => &e.order_id,
            DomainEvent::ProductCreated(p)
            | DomainEvent::ProductUpdated(p)
            | DomainEvent::ProductDeleted(p) => &p.id,
        }
    }

    /// JSON payload as stored in the outbox.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            DomainEvent::OrderCreated(e) => serde_json::to_vec(e),
            DomainEvent::StockUpdateFailed(e) => serde_json::to_vec(e),
            DomainEvent::ProductCreated(p)
            | DomainEvent::ProductUpdated(p)
            | DomainEvent::ProductDeleted(p) => serde_json::to_vec(p),
        }
    }
}
