//! SQLite product catalogue and stock.

use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{info, warn};

use super::ledger::record_in;
use super::outbox::append_in;
use crate::events::{DomainEvent, OrderCreated, ProductEvent, StockUpdateFailed};
use crate::storage::schema::Products;
use crate::storage::{now_text, DedupKey, OutboxEvent, Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: String,
    pub category_id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub stock_quantity: i64,
}

impl Product {
    pub fn to_event(&self, version: i64) -> ProductEvent {
        ProductEvent {
            id: self.id.clone(),
            category_id: self.category_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            price: self.price.to_string(),
            stock_quantity: self.stock_quantity,
            version,
        }
    }
}

/// Version for the next catalogue event of a product.
///
/// Microseconds since the epoch, bumped past the previous version when the
/// clock lags, so a product deleted and created again keeps increasing.
fn next_version(current: Option<i64>) -> i64 {
    let now = Utc::now().timestamp_micros();
    match current {
        Some(previous) => now.max(previous.saturating_add(1)),
        None => now,
    }
}

/// Result of applying an order's stock decrement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockOutcome {
    /// Every line decremented.
    Applied,
    /// The order was already applied (or already compensated).
    Duplicate,
    /// Fewer rows updated than lines requested. Nothing was decremented and
    /// a `stock_update_failed` outbox row was committed instead.
    Shortfall { expected: usize, affected: u64 },
}

/// Decrement one product's stock if enough is available.
///
/// Returns rows affected: 0 when the product is missing or short.
pub async fn decrement_stock_in(
    conn: &mut SqliteConnection,
    product_id: &str,
    quantity: i64,
) -> Result<u64> {
    if quantity <= 0 {
        return Ok(0);
    }
    let query = Query::update()
        .table(Products::Table)
        .value(
            Products::StockQuantity,
            Expr::col(Products::StockQuantity).sub(quantity),
        )
        .value(Products::UpdatedAt, now_text())
        .and_where(Expr::col(Products::Id).eq(product_id))
        .and_where(Expr::col(Products::StockQuantity).gte(quantity))
        .to_string(SqliteQueryBuilder);

    let result = sqlx::query(&query).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

fn row_to_product(row: &SqliteRow) -> Result<Product> {
    let price: String = row.try_get("price")?;
    Ok(Product {
        id: row.try_get("id")?,
        category_id: row.try_get("category_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: Decimal::from_str(&price)
            .map_err(|e| StorageError::Corrupt(format!("bad price '{}': {}", price, e)))?,
        stock_quantity: row.try_get("stock_quantity")?,
    })
}

async fn find_in(conn: &mut SqliteConnection, id: &str) -> Result<Option<Product>> {
    let query = Query::select()
        .columns([
            Products::Id,
            Products::CategoryId,
            Products::Name,
            Products::Description,
            Products::Price,
            Products::StockQuantity,
        ])
        .from(Products::Table)
        .and_where(Expr::col(Products::Id).eq(id))
        .to_string(SqliteQueryBuilder);

    sqlx::query(&query)
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(row_to_product)
        .transpose()
}

async fn version_in(conn: &mut SqliteConnection, id: &str) -> Result<Option<i64>> {
    let query = Query::select()
        .column(Products::Version)
        .from(Products::Table)
        .and_where(Expr::col(Products::Id).eq(id))
        .to_string(SqliteQueryBuilder);
    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    Ok(row.map(|r| r.try_get("version")).transpose()?)
}

/// Products owned by the product service.
///
/// Catalogue mutations write a `product_*` outbox row in the same
/// transaction; stock decrements record the ledger row in theirs.
#[derive(Clone)]
pub struct SqliteProductStore {
    pool: SqlitePool,
}

impl SqliteProductStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Product>> {
        let mut conn = self.pool.acquire().await?;
        find_in(&mut conn, id).await
    }

    /// Insert or update `product`, emitting `product_created` or
    /// `product_updated`.
    pub async fn save(&self, product: &Product) -> Result<OutboxEvent> {
        let mut tx = self.pool.begin().await?;
        let current = version_in(&mut tx, &product.id).await?;
        let existed = current.is_some();
        let version = next_version(current);

        let query = if existed {
            Query::update()
                .table(Products::Table)
                .values([
                    (Products::CategoryId, product.category_id.clone().into()),
                    (Products::Name, product.name.clone().into()),
                    (Products::Description, product.description.clone().into()),
                    (Products::Price, product.price.to_string().into()),
                    (Products::StockQuantity, product.stock_quantity.into()),
                    (Products::Version, version.into()),
                    (Products::UpdatedAt, now_text().into()),
                ])
                .and_where(Expr::col(Products::Id).eq(product.id.as_str()))
                .to_string(SqliteQueryBuilder)
        } else {
            Query::insert()
                .into_table(Products::Table)
                .columns([
                    Products::Id,
                    Products::CategoryId,
                    Products::Name,
                    Products::Description,
                    Products::Price,
                    Products::StockQuantity,
                    Products::Version,
                    Products::UpdatedAt,
                ])
                .values_panic([
                    product.id.clone().into(),
                    product.category_id.clone().into(),
                    product.name.clone().into(),
                    product.description.clone().into(),
                    product.price.to_string().into(),
                    product.stock_quantity.into(),
                    version.into(),
                    now_text().into(),
                ])
                .to_string(SqliteQueryBuilder)
        };
        sqlx::query(&query).execute(&mut *tx).await?;

        let event = if existed {
            DomainEvent::ProductUpdated(product.to_event(version))
        } else {
            DomainEvent::ProductCreated(product.to_event(version))
        };
        let row = OutboxEvent::pending(&event)?;
        append_in(&mut tx, &row).await?;
        tx.commit().await?;

        info!(product_id = %product.id, event_name = %row.event_name, "Product saved");
        Ok(row)
    }

    /// Delete a product, emitting `product_deleted` with its last state.
    /// Returns `None` if there was nothing to delete.
    pub async fn delete(&self, id: &str) -> Result<Option<OutboxEvent>> {
        let mut tx = self.pool.begin().await?;
        let Some(product) = find_in(&mut tx, id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let version = next_version(version_in(&mut tx, id).await?);

        let query = Query::delete()
            .from_table(Products::Table)
            .and_where(Expr::col(Products::Id).eq(id))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *tx).await?;

        let row = OutboxEvent::pending(&DomainEvent::ProductDeleted(product.to_event(version)))?;
        append_in(&mut tx, &row).await?;
        tx.commit().await?;

        info!(product_id = %id, "Product deleted");
        Ok(Some(row))
    }

    /// Decrement stock for every line of `order`, all or nothing.
    ///
    /// The ledger row for `key` commits with the decrements. On a row-count
    /// shortfall the decrements are rolled back and the ledger row commits
    /// together with a `stock_update_failed` outbox row instead.
    pub async fn apply_order(&self, key: &DedupKey, order: &OrderCreated) -> Result<StockOutcome> {
        let mut tx = self.pool.begin().await?;
        if !record_in(&mut tx, key).await? {
            tx.rollback().await?;
            return Ok(StockOutcome::Duplicate);
        }

        let mut affected = 0u64;
        for item in &order.products {
            affected += decrement_stock_in(&mut tx, &item.product_id, item.quantity).await?;
        }

        let expected = order.products.len();
        if affected == expected as u64 {
            tx.commit().await?;
            return Ok(StockOutcome::Applied);
        }
        tx.rollback().await?;

        warn!(
            order_id = %order.order_id,
            expected,
            affected,
            "Stock update touched fewer rows than requested"
        );

        let compensation = OutboxEvent::pending(&DomainEvent::StockUpdateFailed(StockUpdateFailed {
            order_id: order.order_id.clone(),
            products: order.products.clone(),
        }))?;

        let mut tx = self.pool.begin().await?;
        if !record_in(&mut tx, key).await? {
            tx.rollback().await?;
            return Ok(StockOutcome::Duplicate);
        }
        append_in(&mut tx, &compensation).await?;
        tx.commit().await?;

        Ok(StockOutcome::Shortfall { expected, affected })
    }
}
