//! SQLite order store.

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_query::{Expr, Order as SortOrder, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::ledger::record_in;
use super::outbox::append_in;
use crate::events::{DomainEvent, OrderCreated, ProductQuantity};
use crate::saga::{NewOrder, Order, OrderStatus, OrderStore};
use crate::storage::schema::{OrderItems, Orders};
use crate::storage::{now_text, parse_time, DedupKey, OutboxEvent, Result, StorageError};

/// Insert the order row and its items on the caller's connection.
pub async fn insert_order_in(conn: &mut SqliteConnection, order: &Order) -> Result<()> {
    let created_at = order
        .created_at
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    let query = Query::insert()
        .into_table(Orders::Table)
        .columns([
            Orders::Id,
            Orders::UserId,
            Orders::UserEmail,
            Orders::TotalPrice,
            Orders::Status,
            Orders::CreatedAt,
            Orders::UpdatedAt,
        ])
        .values_panic([
            order.id.clone().into(),
            order.user_id.clone().into(),
            order.user_email.clone().into(),
            order.total_price.to_string().into(),
            order.status.as_str().into(),
            created_at.clone().into(),
            created_at.into(),
        ])
        .to_string(SqliteQueryBuilder);
    sqlx::query(&query).execute(&mut *conn).await?;

    for item in &order.items {
        let query = Query::insert()
            .into_table(OrderItems::Table)
            .columns([
                OrderItems::OrderId,
                OrderItems::ProductId,
                OrderItems::Quantity,
            ])
            .values_panic([
                order.id.clone().into(),
                item.product_id.clone().into(),
                item.quantity.into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Flip a `CREATED` order to `CANCELLED` on the caller's connection.
///
/// Returns `false` if the order was already cancelled.
pub async fn cancel_in(conn: &mut SqliteConnection, order_id: &str) -> Result<bool> {
    let query = Query::update()
        .table(Orders::Table)
        .value(Orders::Status, OrderStatus::Cancelled.as_str())
        .value(Orders::UpdatedAt, now_text())
        .and_where(Expr::col(Orders::Id).eq(order_id))
        .and_where(Expr::col(Orders::Status).eq(OrderStatus::Created.as_str()))
        .to_string(SqliteQueryBuilder);
    let result = sqlx::query(&query).execute(&mut *conn).await?;
    if result.rows_affected() == 1 {
        return Ok(true);
    }

    let exists = Query::select()
        .column(Orders::Id)
        .from(Orders::Table)
        .and_where(Expr::col(Orders::Id).eq(order_id))
        .to_string(SqliteQueryBuilder);
    match sqlx::query(&exists).fetch_optional(&mut *conn).await? {
        Some(_) => Ok(false),
        None => Err(StorageError::NotFound {
            entity: "order",
            id: order_id.to_string(),
        }),
    }
}

/// SQLite-backed orders with transactional outbox writes.
#[derive(Clone)]
pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cancel an order in response to an event, recording `key` in the
    /// same transaction. Returns `false` if `key` was already recorded.
    /// An order that is already cancelled still records `key`.
    pub async fn cancel_for_event(&self, key: &DedupKey, order_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !record_in(&mut tx, key).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        let changed = match cancel_in(&mut tx, order_id).await {
            Ok(changed) => changed,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;
        if changed {
            info!(order_id = %order_id, cause = %key.event_name, "Order cancelled");
        } else {
            debug!(order_id = %order_id, "Order already cancelled");
        }
        Ok(true)
    }

    async fn items(&self, order_id: &str) -> Result<Vec<ProductQuantity>> {
        let query = Query::select()
            .columns([OrderItems::ProductId, OrderItems::Quantity])
            .from(OrderItems::Table)
            .and_where(Expr::col(OrderItems::OrderId).eq(order_id))
            .order_by(OrderItems::ProductId, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(ProductQuantity {
                    product_id: row.try_get("product_id")?,
                    quantity: row.try_get("quantity")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn create_with_event(&self, new_order: &NewOrder) -> Result<Order> {
        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new_order.user_id.clone(),
            user_email: new_order.user_email.clone(),
            total_price: new_order.total_price,
            status: OrderStatus::Created,
            items: new_order.items.clone(),
            created_at: chrono::Utc::now(),
        };
        let event = OutboxEvent::pending(&DomainEvent::OrderCreated(OrderCreated {
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            user_email: order.user_email.clone(),
            products: order.items.clone(),
        }))?;

        let mut tx = self.pool.begin().await?;
        insert_order_in(&mut tx, &order).await?;
        append_in(&mut tx, &event).await?;
        tx.commit().await?;

        info!(order_id = %order.id, outbox_id = %event.id, "Order created");
        Ok(order)
    }

    async fn cancel(&self, order_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        cancel_in(&mut conn, order_id).await
    }

    async fn get(&self, order_id: &str) -> Result<Option<Order>> {
        let query = Query::select()
            .columns([
                Orders::Id,
                Orders::UserId,
                Orders::UserEmail,
                Orders::TotalPrice,
                Orders::Status,
                Orders::CreatedAt,
            ])
            .from(Orders::Table)
            .and_where(Expr::col(Orders::Id).eq(order_id))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let total: String = row.try_get("total_price")?;
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(Some(Order {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            user_email: row.try_get("user_email")?,
            total_price: Decimal::from_str(&total)
                .map_err(|e| StorageError::Corrupt(format!("bad order total '{}': {}", total, e)))?,
            status: status.parse()?,
            items: self.items(order_id).await?,
            created_at: parse_time(&created_at)?,
        }))
    }
}
