//! Processed-events ledger.

use std::fmt;

use async_trait::async_trait;

use super::Result;
use crate::events::EventName;

/// Identity of an applied effect: `(aggregate_id, event_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub aggregate_id: String,
    pub event_name: String,
}

impl DedupKey {
    pub fn new(aggregate_id: impl Into<String>, event_name: EventName) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            event_name: event_name.as_str().to_string(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_id, self.event_name)
    }
}

/// Durable set of effects already applied by this service.
///
/// Rows are never updated or deleted.
#[async_trait]
pub trait ProcessedEventLedger: Send + Sync {
    /// Whether `key` has been recorded.
    async fn contains(&self, key: &DedupKey) -> Result<bool>;

    /// Record `key`. Returns `false` if it was already present.
    async fn record(&self, key: &DedupKey) -> Result<bool>;
}
