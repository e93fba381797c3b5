//! SQLite ProcessedEventLedger implementation.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{SqliteConnection, SqlitePool};

use crate::storage::schema::ProcessedEvents;
use crate::storage::{now_text, DedupKey, ProcessedEventLedger, Result};

/// Record `key` on the caller's connection.
///
/// Returns `false` when the key already exists, which inside an effect
/// transaction means another delivery of the same event already won.
pub async fn record_in(conn: &mut SqliteConnection, key: &DedupKey) -> Result<bool> {
    let query = Query::insert()
        .into_table(ProcessedEvents::Table)
        .columns([
            ProcessedEvents::AggregateId,
            ProcessedEvents::EventName,
            ProcessedEvents::ProcessedAt,
        ])
        .values_panic([
            key.aggregate_id.clone().into(),
            key.event_name.clone().into(),
            now_text().into(),
        ])
        .on_conflict(
            OnConflict::columns([ProcessedEvents::AggregateId, ProcessedEvents::EventName])
                .do_nothing()
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder);

    let result = sqlx::query(&query).execute(&mut *conn).await?;
    Ok(result.rows_affected() == 1)
}

pub async fn contains_in(conn: &mut SqliteConnection, key: &DedupKey) -> Result<bool> {
    let query = Query::select()
        .expr(Expr::val(1))
        .from(ProcessedEvents::Table)
        .and_where(Expr::col(ProcessedEvents::AggregateId).eq(key.aggregate_id.as_str()))
        .and_where(Expr::col(ProcessedEvents::EventName).eq(key.event_name.as_str()))
        .limit(1)
        .to_string(SqliteQueryBuilder);

    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    Ok(row.is_some())
}

/// SQLite implementation of ProcessedEventLedger.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventLedger for SqliteLedger {
    async fn contains(&self, key: &DedupKey) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        contains_in(&mut conn, key).await
    }

    async fn record(&self, key: &DedupKey) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        record_in(&mut conn, key).await
    }
}
