//! SQLite carts.

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tonic::Status;
use tracing::debug;

use super::ledger::record_in;
use crate::context::Context;
use crate::saga::{Cart, CartClient, CartProduct};
use crate::storage::schema::{CartItems, Carts};
use crate::storage::{DedupKey, Result, StorageError};

async fn cart_id_in(conn: &mut SqliteConnection, user_id: &str) -> Result<Option<String>> {
    let query = Query::select()
        .column(Carts::Id)
        .from(Carts::Table)
        .and_where(Expr::col(Carts::UserId).eq(user_id))
        .to_string(SqliteQueryBuilder);
    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    Ok(row.map(|r| r.try_get("id")).transpose()?)
}

/// Remove every line from the user's cart. Returns lines removed.
pub async fn clear_in(conn: &mut SqliteConnection, user_id: &str) -> Result<u64> {
    let Some(cart_id) = cart_id_in(conn, user_id).await? else {
        return Ok(0);
    };
    let query = Query::delete()
        .from_table(CartItems::Table)
        .and_where(Expr::col(CartItems::CartId).eq(cart_id))
        .to_string(SqliteQueryBuilder);
    let result = sqlx::query(&query).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

fn combined_quantity(current: i64, added: i64) -> Result<i64> {
    current.checked_add(added).ok_or_else(|| {
        StorageError::Invalid(format!("quantity {} + {} overflows", current, added))
    })
}

/// Carts owned by the cart service.
#[derive(Clone)]
pub struct SqliteCartStore {
    pool: SqlitePool,
}

impl SqliteCartStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add `quantity` of a product, creating the cart on first use.
    /// Adding a product already in the cart increases its quantity and
    /// takes the new unit price.
    pub async fn add_item(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i64,
        unit_price: Decimal,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let insert_cart = Query::insert()
            .into_table(Carts::Table)
            .columns([Carts::Id, Carts::UserId])
            .values_panic([uuid::Uuid::new_v4().to_string().into(), user_id.into()])
            .on_conflict(OnConflict::column(Carts::UserId).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&insert_cart).execute(&mut *tx).await?;

        let cart_id = cart_id_in(&mut tx, user_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "cart",
                id: user_id.to_string(),
            })?;

        let existing = Query::select()
            .column(CartItems::Quantity)
            .from(CartItems::Table)
            .and_where(Expr::col(CartItems::CartId).eq(cart_id.as_str()))
            .and_where(Expr::col(CartItems::ProductId).eq(product_id))
            .to_string(SqliteQueryBuilder);
        let current: Option<i64> = sqlx::query(&existing)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("quantity"))
            .transpose()?;

        let query = match current {
            Some(current) => Query::update()
                .table(CartItems::Table)
                .values([
                    (CartItems::Quantity, combined_quantity(current, quantity)?.into()),
                    (CartItems::UnitPrice, unit_price.to_string().into()),
                ])
                .and_where(Expr::col(CartItems::CartId).eq(cart_id.as_str()))
                .and_where(Expr::col(CartItems::ProductId).eq(product_id))
                .to_string(SqliteQueryBuilder),
            None => Query::insert()
                .into_table(CartItems::Table)
                .columns([
                    CartItems::CartId,
                    CartItems::ProductId,
                    CartItems::Quantity,
                    CartItems::UnitPrice,
                ])
                .values_panic([
                    cart_id.as_str().into(),
                    product_id.into(),
                    quantity.into(),
                    unit_price.to_string().into(),
                ])
                .to_string(SqliteQueryBuilder),
        };
        sqlx::query(&query).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// The user's cart with its lines, or `None` if they never had one.
    pub async fn cart_for_user(&self, user_id: &str) -> Result<Option<Cart>> {
        let mut conn = self.pool.acquire().await?;
        let Some(cart_id) = cart_id_in(&mut conn, user_id).await? else {
            return Ok(None);
        };

        let query = Query::select()
            .columns([CartItems::ProductId, CartItems::Quantity, CartItems::UnitPrice])
            .from(CartItems::Table)
            .and_where(Expr::col(CartItems::CartId).eq(cart_id.as_str()))
            .order_by(CartItems::ProductId, Order::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;

        let products = rows
            .iter()
            .map(|row| {
                let price: String = row.try_get("unit_price")?;
                Ok(CartProduct {
                    product_id: row.try_get("product_id")?,
                    quantity: row.try_get("quantity")?,
                    unit_price: Decimal::from_str(&price).map_err(|e| {
                        StorageError::Corrupt(format!("bad unit price '{}': {}", price, e))
                    })?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let total_price = Cart::line_total(&products).ok_or_else(|| {
            StorageError::Corrupt(format!("cart {} total overflows", cart_id))
        })?;

        Ok(Some(Cart {
            id: cart_id,
            total_price,
            products,
        }))
    }

    /// Lines in the user's cart; empty if there is no cart.
    pub async fn items_for_user(&self, user_id: &str) -> Result<Vec<CartProduct>> {
        Ok(self
            .cart_for_user(user_id)
            .await?
            .map(|cart| cart.products)
            .unwrap_or_default())
    }

    /// Clear the cart for an order, recording `key` in the same
    /// transaction. Returns `false` if `key` was already recorded.
    pub async fn clear_for_order(&self, key: &DedupKey, user_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !record_in(&mut tx, key).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        let removed = clear_in(&mut tx, user_id).await?;
        tx.commit().await?;
        debug!(user_id = %user_id, removed, "Cart cleared");
        Ok(true)
    }
}

#[async_trait]
impl CartClient for SqliteCartStore {
    async fn get_cart(&self, ctx: &Context, user_id: &str) -> std::result::Result<Cart, Status> {
        ctx.check()?;
        match self.cart_for_user(user_id).await {
            Ok(Some(cart)) => Ok(cart),
            Ok(None) => Err(Status::not_found(format!("cart for user {}", user_id))),
            Err(err) => Err(Status::from(err)),
        }
    }
}
