//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::{ColumnDef, Expr, Iden, Index, SqliteQueryBuilder, Table};

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "event_name"]
    EventName,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "created_at"]
    CreatedAt,
}

/// Processed-events ledger schema.
#[derive(Iden)]
pub enum ProcessedEvents {
    Table,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "event_name"]
    EventName,
    #[iden = "processed_at"]
    ProcessedAt,
}

/// Orders table schema.
#[derive(Iden)]
pub enum Orders {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "user_id"]
    UserId,
    #[iden = "user_email"]
    UserEmail,
    #[iden = "total_price"]
    TotalPrice,
    #[iden = "status"]
    Status,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Order line items.
#[derive(Iden)]
pub enum OrderItems {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "product_id"]
    ProductId,
    #[iden = "quantity"]
    Quantity,
}

/// Products table schema.
#[derive(Iden)]
pub enum Products {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "category_id"]
    CategoryId,
    #[iden = "name"]
    Name,
    #[iden = "description"]
    Description,
    #[iden = "price"]
    Price,
    #[iden = "stock_quantity"]
    StockQuantity,
    #[iden = "version"]
    Version,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Carts table schema.
#[derive(Iden)]
pub enum Carts {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "user_id"]
    UserId,
}

/// Cart line items.
#[derive(Iden)]
pub enum CartItems {
    Table,
    #[iden = "cart_id"]
    CartId,
    #[iden = "product_id"]
    ProductId,
    #[iden = "quantity"]
    Quantity,
    #[iden = "unit_price"]
    UnitPrice,
}

/// DDL for every table and index, in creation order.
pub fn create_statements() -> Vec<String> {
    vec![
        Table::create()
            .table(Outbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Outbox::Id).text().primary_key())
            .col(ColumnDef::new(Outbox::AggregateId).text().not_null())
            .col(ColumnDef::new(Outbox::EventName).text().not_null())
            .col(ColumnDef::new(Outbox::Payload).blob().not_null())
            .col(
                ColumnDef::new(Outbox::Status)
                    .text()
                    .not_null()
                    .default("PENDING"),
            )
            .col(ColumnDef::new(Outbox::CreatedAt).text().not_null())
            .to_string(SqliteQueryBuilder),
        // Relay polling: pending rows, oldest first.
        Index::create()
            .if_not_exists()
            .name("idx_outbox_status_created_at")
            .table(Outbox::Table)
            .col(Outbox::Status)
            .col(Outbox::CreatedAt)
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(ProcessedEvents::Table)
            .if_not_exists()
            .col(ColumnDef::new(ProcessedEvents::AggregateId).text().not_null())
            .col(ColumnDef::new(ProcessedEvents::EventName).text().not_null())
            .col(ColumnDef::new(ProcessedEvents::ProcessedAt).text().not_null())
            .primary_key(
                Index::create()
                    .col(ProcessedEvents::AggregateId)
                    .col(ProcessedEvents::EventName),
            )
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(Orders::Table)
            .if_not_exists()
            .col(ColumnDef::new(Orders::Id).text().primary_key())
            .col(ColumnDef::new(Orders::UserId).text().not_null())
            .col(ColumnDef::new(Orders::UserEmail).text().not_null())
            .col(ColumnDef::new(Orders::TotalPrice).text().not_null())
            .col(ColumnDef::new(Orders::Status).text().not_null())
            .col(ColumnDef::new(Orders::CreatedAt).text().not_null())
            .col(ColumnDef::new(Orders::UpdatedAt).text().not_null())
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(OrderItems::Table)
            .if_not_exists()
            .col(ColumnDef::new(OrderItems::OrderId).text().not_null())
            .col(ColumnDef::new(OrderItems::ProductId).text().not_null())
            .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
            .to_string(SqliteQueryBuilder),
        Index::create()
            .if_not_exists()
            .name("idx_order_items_order_id")
            .table(OrderItems::Table)
            .col(OrderItems::OrderId)
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(Products::Table)
            .if_not_exists()
            .col(ColumnDef::new(Products::Id).text().primary_key())
            .col(ColumnDef::new(Products::CategoryId).text().not_null())
            .col(ColumnDef::new(Products::Name).text().not_null())
            .col(
                ColumnDef::new(Products::Description)
                    .text()
                    .not_null()
                    .default(""),
            )
            .col(ColumnDef::new(Products::Price).text().not_null())
            .col(
                ColumnDef::new(Products::StockQuantity)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(
                ColumnDef::new(Products::Version)
                    .big_integer()
                    .not_null()
                    .default(0),
            )
            .col(
                ColumnDef::new(Products::UpdatedAt)
                    .text()
                    .not_null()
                    .default(Expr::cust("(strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))")),
            )
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(Carts::Table)
            .if_not_exists()
            .col(ColumnDef::new(Carts::Id).text().primary_key())
            .col(ColumnDef::new(Carts::UserId).text().not_null().unique_key())
            .to_string(SqliteQueryBuilder),
        Table::create()
            .table(CartItems::Table)
            .if_not_exists()
            .col(ColumnDef::new(CartItems::CartId).text().not_null())
            .col(ColumnDef::new(CartItems::ProductId).text().not_null())
            .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
            .col(ColumnDef::new(CartItems::UnitPrice).text().not_null())
            .primary_key(
                Index::create()
                    .col(CartItems::CartId)
                    .col(CartItems::ProductId),
            )
            .to_string(SqliteQueryBuilder),
    ]
}
