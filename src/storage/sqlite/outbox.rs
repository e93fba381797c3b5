//! SQLite OutboxStore implementation.

use async_trait::async_trait;
use sea_query::{Alias, Expr, Func, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::storage::schema::Outbox;
use crate::storage::{parse_time, OutboxEvent, OutboxStatus, OutboxStore, Result};

/// Insert `event` using the caller's connection, typically an open
/// transaction that also carries the business mutation.
pub async fn append_in(conn: &mut SqliteConnection, event: &OutboxEvent) -> Result<()> {
    let query = Query::insert()
        .into_table(Outbox::Table)
        .columns([
            Outbox::Id,
            Outbox::AggregateId,
            Outbox::EventName,
            Outbox::Payload,
            Outbox::Status,
            Outbox::CreatedAt,
        ])
        .values_panic([
            event.id.clone().into(),
            event.aggregate_id.clone().into(),
            event.event_name.clone().into(),
            event.payload.clone().into(),
            event.status.as_str().into(),
            event
                .created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
                .into(),
        ])
        .to_string(SqliteQueryBuilder);

    sqlx::query(&query).execute(&mut *conn).await?;

    debug!(
        id = %event.id,
        event_name = %event.event_name,
        aggregate_id = %event.aggregate_id,
        "Event written to outbox"
    );
    Ok(())
}

fn row_to_event(row: &SqliteRow) -> Result<OutboxEvent> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_name: row.try_get("event_name")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        created_at: parse_time(&created_at)?,
    })
}

/// SQLite implementation of OutboxStore.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every row regardless of status, oldest first.
    pub async fn list(&self) -> Result<Vec<OutboxEvent>> {
        let query = Query::select()
            .columns([
                Outbox::Id,
                Outbox::AggregateId,
                Outbox::EventName,
                Outbox::Payload,
                Outbox::Status,
                Outbox::CreatedAt,
            ])
            .from(Outbox::Table)
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by(Outbox::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn get_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let query = Query::select()
            .columns([
                Outbox::Id,
                Outbox::AggregateId,
                Outbox::EventName,
                Outbox::Payload,
                Outbox::Status,
                Outbox::CreatedAt,
            ])
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Pending.as_str()))
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by(Outbox::Id, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn mark_published(&self, id: &str) -> Result<()> {
        let query = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Status, OutboxStatus::Published.as_str())
            .and_where(Expr::col(Outbox::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        let query = Query::select()
            .expr_as(Func::count(Expr::col(Outbox::Id)), Alias::new("pending"))
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Pending.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let pending: i64 = row.try_get("pending")?;
        Ok(pending.max(0) as u64)
    }
}
