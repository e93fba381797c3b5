//! Marketflow - reliable cross-service coordination
//!
//! Building blocks for services that keep independent databases consistent
//! through events: a durable broker client, a transactional outbox with its
//! relay, idempotent consumers guarded by a processed-events ledger, and the
//! order saga with compensation.

pub mod bus;
pub mod config;
pub mod consumers;
pub mod context;
pub mod events;
pub mod relay;
pub mod saga;
pub mod storage;
pub mod utils;
