//! Transactional outbox records.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Result, StorageError};
use crate::events::DomainEvent;

/// Publication state of an outbox row. `Pending` → `Published`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            other => Err(StorageError::Corrupt(format!("unknown outbox status '{}'", other))),
        }
    }
}

/// An event recorded alongside the business mutation that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    /// Unique row id, reused as the broker message id.
    pub id: String,
    pub aggregate_id: String,
    /// Routing key; also names the target exchange.
    pub event_name: String,
    /// JSON body.
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// New pending row for `event`.
    pub fn pending(event: &DomainEvent) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            event_name: event.name().as_str().to_string(),
            payload: event.to_payload()?,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
        })
    }
}

/// Read/transition side of the outbox, used by the relay.
///
/// Rows are written by the business stores inside their own transactions.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` pending rows, oldest first.
    async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Transition a row to `Published`. Marking an already published row
    /// is a no-op.
    async fn mark_published(&self, id: &str) -> Result<()>;

    /// Number of rows still pending.
    async fn pending_count(&self) -> Result<u64>;
}
