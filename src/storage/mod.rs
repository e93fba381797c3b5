//! Per-service relational storage.
//!
//! Every service owns one SQLite database holding its business tables next
//! to the outbox and the processed-events ledger, so a business mutation and
//! its outbox row (or an effect and its ledger row) commit together.

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

pub mod ledger;
pub mod mock;
pub mod outbox;
pub mod schema;
pub mod sqlite;

pub use ledger::{DedupKey, ProcessedEventLedger};
pub use outbox::{OutboxEvent, OutboxStatus, OutboxStore};
pub use sqlite::{
    SqliteCartStore, SqliteLedger, SqliteOrderStore, SqliteOutboxStore, SqliteProductStore,
};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid stored data: {0}")]
    Corrupt(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Raised by mock stores when a failure has been configured.
    #[error("Injected failure: {0}")]
    Injected(String),
}

impl StorageError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(err) => is_transient_sqlx(err),
            StorageError::Injected(_) => true,
            StorageError::Serialization(_)
            | StorageError::NotFound { .. }
            | StorageError::Corrupt(_)
            | StorageError::Invalid(_) => false,
        }
    }
}

impl From<StorageError> for tonic::Status {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::NotFound { .. } => tonic::Status::not_found(err.to_string()),
            StorageError::Invalid(_) => tonic::Status::invalid_argument(err.to_string()),
            _ if err.is_transient() => tonic::Status::unavailable(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY / SQLITE_LOCKED
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:./data/marketflow.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// Open the pool described by `config` and create missing tables.
pub async fn init_storage(config: &StorageConfig) -> Result<SqlitePool> {
    info!(url = %config.url, "Storage: sqlite");

    let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with the full schema.
///
/// One connection keeps every query on the same in-memory database.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes if they do not exist.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in schema::create_statements() {
        sqlx::query(&statement).execute(pool).await?;
    }
    Ok(())
}

/// Current time in the sortable text form stored in every table.
pub(crate) fn now_text() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(text: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", text, e)))
}
