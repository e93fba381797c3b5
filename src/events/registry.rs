//! Event name to decoder registry.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use super::{DomainEvent, EventName};

/// Errors decoding an inbound event. All of them are permanent: the same
/// bytes will fail the same way on every redelivery.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown event name: {0}")]
    UnknownEvent(String),

    #[error("No decoder registered for {0}")]
    Unregistered(EventName),

    #[error("Malformed {event} payload: {source}")]
    Malformed {
        event: EventName,
        #[source]
        source: serde_json::Error,
    },
}

type Decoder = fn(&[u8]) -> Result<DomainEvent, serde_json::Error>;

fn json<T, F>(body: &[u8], wrap: F) -> Result<DomainEvent, serde_json::Error>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> DomainEvent,
{
    serde_json::from_slice(body).map(wrap)
}

/// Maps event names to payload decoders.
pub struct EventRegistry {
    decoders: HashMap<EventName, Decoder>,
}

impl Default for EventRegistry {
    /// Registry with every known event.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(EventName::OrderCreated, |b| json(b, DomainEvent::OrderCreated));
        registry.register(EventName::StockUpdateFailed, |b| {
            json(b, DomainEvent::StockUpdateFailed)
        });
        registry.register(EventName::ProductCreated, |b| json(b, DomainEvent::ProductCreated));
        registry.register(EventName::ProductUpdated, |b| json(b, DomainEvent::ProductUpdated));
        registry.register(EventName::ProductDeleted, |b| json(b, DomainEvent::ProductDeleted));
        registry
    }
}

impl EventRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: EventName, decoder: Decoder) {
        self.decoders.insert(name, decoder);
    }

    pub fn contains(&self, name: EventName) -> bool {
        self.decoders.contains_key(&name)
    }

    /// Decode `body` as the event named `name` (routing key / outbox name).
    pub fn decode(&self, name: &str, body: &[u8]) -> Result<DomainEvent, DecodeError> {
        let event: EventName = name.parse()?;
        let decoder = self
            .decoders
            .get(&event)
            .ok_or(DecodeError::Unregistered(event))?;
        decoder(body).map_err(|source| DecodeError::Malformed { event, source })
    }
}
