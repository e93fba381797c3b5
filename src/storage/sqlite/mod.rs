//! SQLite implementations of storage interfaces.
//!
//! The `*_in` functions run on a caller-supplied connection so they can be
//! composed inside one transaction.

pub mod carts;
pub mod ledger;
pub mod orders;
pub mod outbox;
pub mod products;

pub use carts::SqliteCartStore;
pub use ledger::SqliteLedger;
pub use orders::SqliteOrderStore;
pub use outbox::SqliteOutboxStore;
pub use products::{Product, SqliteProductStore, StockOutcome};

#[cfg(test)]
mod tests;
