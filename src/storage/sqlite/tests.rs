use super::*;
use crate::context::Context;
use crate::events::{EventName, OrderCreated, ProductQuantity};
use crate::saga::{CartClient, NewOrder, OrderStatus, OrderStore};
use crate::storage::{
    memory_pool, DedupKey, OutboxEvent, OutboxStatus, OutboxStore, ProcessedEventLedger,
    StorageError,
};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::str::FromStr;
use tonic::Code;

fn price(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn product(id: &str, stock: i64) -> Product {
    Product {
        id: id.to_string(),
        category_id: "C1".to_string(),
        name: format!("Product {}", id),
        description: String::new(),
        price: price("9.99"),
        stock_quantity: stock,
    }
}

fn line(product_id: &str, quantity: i64) -> ProductQuantity {
    ProductQuantity {
        product_id: product_id.to_string(),
        quantity,
    }
}

fn order_created(order_id: &str, products: Vec<ProductQuantity>) -> OrderCreated {
    OrderCreated {
        order_id: order_id.to_string(),
        user_id: "U1".to_string(),
        user_email: "u1@example.com".to_string(),
        products,
    }
}

fn new_order() -> NewOrder {
    NewOrder {
        user_id: "U1".to_string(),
        user_email: "u1@example.com".to_string(),
        total_price: price("19.98"),
        items: vec![line("P1", 2)],
    }
}

async fn stock_of(store: &SqliteProductStore, id: &str) -> i64 {
    store.get(id).await.unwrap().unwrap().stock_quantity
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap();
    n
}

// ============================================================================
// Outbox
// ============================================================================

#[tokio::test]
async fn test_order_and_outbox_row_commit_together() {
    let pool = memory_pool().await.unwrap();
    let orders = SqliteOrderStore::new(pool.clone());
    let outbox = SqliteOutboxStore::new(pool.clone());

    let order = orders.create_with_event(&new_order()).await.unwrap();

    let pending = outbox.get_unpublished(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].aggregate_id, order.id);
    assert_eq!(pending[0].event_name, "order_created");
    assert_eq!(pending[0].status, OutboxStatus::Pending);

    let body: serde_json::Value = serde_json::from_slice(&pending[0].payload).unwrap();
    assert_eq!(body["orderId"], order.id.as_str());
    assert_eq!(body["userEmail"], "u1@example.com");
    assert_eq!(body["products"][0]["productId"], "P1");
    assert_eq!(body["products"][0]["quantity"], 2);
}

#[tokio::test]
async fn test_rolled_back_mutation_leaves_no_outbox_row() {
    let pool = memory_pool().await.unwrap();
    let existing = OutboxEvent::pending(&crate::events::DomainEvent::StockUpdateFailed(
        crate::events::StockUpdateFailed {
            order_id: "O0".to_string(),
            products: vec![],
        },
    ))
    .unwrap();
    {
        let mut conn = pool.acquire().await.unwrap();
        outbox::append_in(&mut conn, &existing).await.unwrap();
    }

    let order = crate::saga::Order {
        id: "O1".to_string(),
        user_id: "U1".to_string(),
        user_email: "u1@example.com".to_string(),
        total_price: price("10"),
        status: OrderStatus::Created,
        items: vec![line("P1", 1)],
        created_at: chrono::Utc::now(),
    };

    // The order insert succeeds, then the outbox insert fails before commit.
    let mut tx = pool.begin().await.unwrap();
    orders::insert_order_in(&mut tx, &order).await.unwrap();
    let mut clashing = existing.clone();
    clashing.aggregate_id = "O1".to_string();
    assert!(outbox::append_in(&mut tx, &clashing).await.is_err());
    tx.rollback().await.unwrap();

    assert_eq!(count(&pool, "orders").await, 0);
    assert_eq!(count(&pool, "order_items").await, 0);
    assert_eq!(count(&pool, "outbox").await, 1);
}

#[tokio::test]
async fn test_mark_published_removes_row_from_pending() {
    let pool = memory_pool().await.unwrap();
    let orders = SqliteOrderStore::new(pool.clone());
    let outbox = SqliteOutboxStore::new(pool.clone());

    orders.create_with_event(&new_order()).await.unwrap();
    orders.create_with_event(&new_order()).await.unwrap();
    assert_eq!(outbox.pending_count().await.unwrap(), 2);

    let first = outbox.get_unpublished(1).await.unwrap();
    assert_eq!(first.len(), 1);
    outbox.mark_published(&first[0].id).await.unwrap();
    // Idempotent.
    outbox.mark_published(&first[0].id).await.unwrap();

    assert_eq!(outbox.pending_count().await.unwrap(), 1);
    let remaining = outbox.get_unpublished(10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].id, first[0].id);

    let all = outbox.list().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].status, OutboxStatus::Published);
}

// ============================================================================
// Ledger
// ============================================================================

#[tokio::test]
async fn test_ledger_records_once() {
    let pool = memory_pool().await.unwrap();
    let ledger = SqliteLedger::new(pool);
    let key = DedupKey::new("O1", EventName::OrderCreated);

    assert!(!ledger.contains(&key).await.unwrap());
    assert!(ledger.record(&key).await.unwrap());
    assert!(!ledger.record(&key).await.unwrap());
    assert!(ledger.contains(&key).await.unwrap());
    assert!(!ledger
        .contains(&DedupKey::new("O1", EventName::StockUpdateFailed))
        .await
        .unwrap());
}

// ============================================================================
// Products
// ============================================================================

#[tokio::test]
async fn test_product_save_and_delete_emit_events() {
    let pool = memory_pool().await.unwrap();
    let products = SqliteProductStore::new(pool.clone());

    let created = products.save(&product("P1", 5)).await.unwrap();
    assert_eq!(created.event_name, "product_created");

    let mut changed = product("P1", 7);
    changed.price = price("12.50");
    let updated = products.save(&changed).await.unwrap();
    assert_eq!(updated.event_name, "product_updated");
    let body: serde_json::Value = serde_json::from_slice(&updated.payload).unwrap();
    assert_eq!(body["price"], "12.50");
    assert_eq!(body["stockQuantity"], 7);

    let deleted = products.delete("P1").await.unwrap().unwrap();
    assert_eq!(deleted.event_name, "product_deleted");

    let version = |row: &OutboxEvent| {
        serde_json::from_slice::<serde_json::Value>(&row.payload).unwrap()["version"]
            .as_i64()
            .unwrap()
    };
    assert!(version(&created) > 0);
    assert!(version(&updated) > version(&created));
    assert!(version(&deleted) > version(&updated));
    assert!(products.get("P1").await.unwrap().is_none());
    assert!(products.delete("P1").await.unwrap().is_none());

    assert_eq!(count(&pool, "outbox").await, 3);
}

#[tokio::test]
async fn test_apply_order_decrements_once() {
    let pool = memory_pool().await.unwrap();
    let products = SqliteProductStore::new(pool.clone());
    products.save(&product("P1", 10)).await.unwrap();

    let order = order_created("O1", vec![line("P1", 2)]);
    let key = DedupKey::new("O1", EventName::OrderCreated);

    assert_eq!(
        products.apply_order(&key, &order).await.unwrap(),
        StockOutcome::Applied
    );
    assert_eq!(stock_of(&products, "P1").await, 8);

    assert_eq!(
        products.apply_order(&key, &order).await.unwrap(),
        StockOutcome::Duplicate
    );
    assert_eq!(stock_of(&products, "P1").await, 8);
}

#[tokio::test]
async fn test_missing_product_causes_shortfall_and_compensation() {
    let pool = memory_pool().await.unwrap();
    let products = SqliteProductStore::new(pool.clone());
    let outbox = SqliteOutboxStore::new(pool.clone());
    products.save(&product("P1", 10)).await.unwrap();
    products.save(&product("P2", 10)).await.unwrap();
    for row in outbox.get_unpublished(10).await.unwrap() {
        outbox.mark_published(&row.id).await.unwrap();
    }

    let order = order_created("O1", vec![line("P1", 1), line("P2", 1), line("P3", 1)]);
    let key = DedupKey::new("O1", EventName::OrderCreated);

    assert_eq!(
        products.apply_order(&key, &order).await.unwrap(),
        StockOutcome::Shortfall {
            expected: 3,
            affected: 2
        }
    );
    assert_eq!(stock_of(&products, "P1").await, 10);
    assert_eq!(stock_of(&products, "P2").await, 10);

    let pending = outbox.get_unpublished(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_name, "stock_update_failed");
    assert_eq!(pending[0].aggregate_id, "O1");

    // A redelivery neither decrements nor compensates twice.
    assert_eq!(
        products.apply_order(&key, &order).await.unwrap(),
        StockOutcome::Duplicate
    );
    assert_eq!(outbox.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_insufficient_stock_is_a_shortfall() {
    let pool = memory_pool().await.unwrap();
    let products = SqliteProductStore::new(pool.clone());
    products.save(&product("P1", 1)).await.unwrap();

    let outcome = products
        .apply_order(
            &DedupKey::new("O2", EventName::OrderCreated),
            &order_created("O2", vec![line("P1", 2)]),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, StockOutcome::Shortfall { affected: 0, .. }));
    assert_eq!(stock_of(&products, "P1").await, 1);
}

// ============================================================================
// Orders
// ============================================================================

#[tokio::test]
async fn test_order_cancel_transitions_once() {
    let pool = memory_pool().await.unwrap();
    let orders = SqliteOrderStore::new(pool);

    let order = orders.create_with_event(&new_order()).await.unwrap();
    let loaded = orders.get(&order.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, OrderStatus::Created);
    assert_eq!(loaded.items, vec![line("P1", 2)]);
    assert_eq!(loaded.total_price, price("19.98"));

    assert!(orders.cancel(&order.id).await.unwrap());
    assert!(!orders.cancel(&order.id).await.unwrap());
    assert_eq!(
        orders.get(&order.id).await.unwrap().unwrap().status,
        OrderStatus::Cancelled
    );

    let err = orders.cancel("missing").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { entity: "order", .. }));
    assert!(orders.get("missing").await.unwrap().is_none());
}

// ============================================================================
// Carts
// ============================================================================

#[tokio::test]
async fn test_cart_lines_and_total() {
    let pool = memory_pool().await.unwrap();
    let carts = SqliteCartStore::new(pool);

    carts.add_item("U1", "P1", 2, price("9.99")).await.unwrap();
    carts.add_item("U1", "P2", 1, price("5.00")).await.unwrap();
    carts.add_item("U1", "P1", 1, price("9.99")).await.unwrap();

    let cart = carts.cart_for_user("U1").await.unwrap().unwrap();
    assert_eq!(cart.products.len(), 2);
    assert_eq!(cart.products[0].quantity, 3);
    assert_eq!(cart.total_price, price("34.97"));
}

#[tokio::test]
async fn test_clear_for_order_is_idempotent() {
    let pool = memory_pool().await.unwrap();
    let carts = SqliteCartStore::new(pool);
    let key = DedupKey::new("O1", EventName::OrderCreated);

    carts.add_item("U1", "P1", 1, price("1.00")).await.unwrap();
    assert!(carts.clear_for_order(&key, "U1").await.unwrap());
    assert!(carts.items_for_user("U1").await.unwrap().is_empty());

    // Items added after the order was placed survive a redelivery.
    carts.add_item("U1", "P2", 1, price("1.00")).await.unwrap();
    assert!(!carts.clear_for_order(&key, "U1").await.unwrap());
    assert_eq!(carts.items_for_user("U1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cart_client_reports_missing_cart() {
    let pool = memory_pool().await.unwrap();
    let carts = SqliteCartStore::new(pool);

    let err = carts
        .get_cart(&Context::background(), "nobody")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    carts.add_item("U1", "P1", 1, price("1.00")).await.unwrap();
    let cart = carts.get_cart(&Context::background(), "U1").await.unwrap();
    assert_eq!(cart.products.len(), 1);
}

#[tokio::test]
async fn test_cart_total_overflow_is_an_error() {
    let pool = memory_pool().await.unwrap();
    let carts = SqliteCartStore::new(pool);

    carts
        .add_item("U1", "P1", i64::MAX, price("100000000000"))
        .await
        .unwrap();

    let err = carts.cart_for_user("U1").await.unwrap_err();
    assert!(matches!(err, StorageError::Corrupt(_)));

    let status = carts
        .get_cart(&Context::background(), "U1")
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
}

#[tokio::test]
async fn test_add_item_rejects_quantity_overflow() {
    let pool = memory_pool().await.unwrap();
    let carts = SqliteCartStore::new(pool);

    carts.add_item("U1", "P1", i64::MAX, price("1.00")).await.unwrap();
    let err = carts
        .add_item("U1", "P1", 1, price("1.00"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Invalid(_)));
    assert_eq!(tonic::Status::from(err).code(), Code::InvalidArgument);

    let items = carts.items_for_user("U1").await.unwrap();
    assert_eq!(items[0].quantity, i64::MAX);
}

#[tokio::test]
async fn test_cancel_for_event_records_key_once() {
    let pool = memory_pool().await.unwrap();
    let orders = SqliteOrderStore::new(pool.clone());
    let order = orders.create_with_event(&new_order()).await.unwrap();
    let key = DedupKey::new(order.id.as_str(), EventName::StockUpdateFailed);

    assert!(orders.cancel_for_event(&key, &order.id).await.unwrap());
    assert!(!orders.cancel_for_event(&key, &order.id).await.unwrap());
    assert_eq!(
        orders.get(&order.id).await.unwrap().unwrap().status,
        OrderStatus::Cancelled
    );

    let missing = DedupKey::new("missing", EventName::StockUpdateFailed);
    assert!(orders.cancel_for_event(&missing, "missing").await.is_err());
    assert!(!SqliteLedger::new(pool).contains(&missing).await.unwrap());
}
