//! Order creation saga.
//!
//! ```text
//! START → CART_FETCHED → ORDER_PERSISTED → PAYMENT_ATTEMPTED → COMPLETED
//!                                                           ↘ CANCELLING → CANCELLED
//! ```
//!
//! The order row and its `order_created` outbox row commit together; that
//! commit is the point after which the order exists regardless of payment.
//! A failed payment is compensated by cancelling the order, and the caller
//! always receives the payment error even if the cancellation fails.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tonic::{Code, Status};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::events::ProductQuantity;
use crate::storage::{self, StorageError};
use crate::utils::retry::is_retryable_status;

pub mod clients;

pub use clients::{Cart, CartClient, CartProduct, Payment, PaymentClient, PaymentRequest};

/// Order lifecycle. `Created` → `Cancelled` is the only transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Created,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(OrderStatus::Created),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(StorageError::Corrupt(format!("unknown order status '{}'", other))),
        }
    }
}

/// Order to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: String,
    pub user_email: String,
    pub total_price: Decimal,
    pub items: Vec<ProductQuantity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub user_email: String,
    pub total_price: Decimal,
    pub status: OrderStatus,
    pub items: Vec<ProductQuantity>,
    pub created_at: DateTime<Utc>,
}

/// Order persistence owned by the order service.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist the order and its `order_created` outbox row in one
    /// transaction.
    async fn create_with_event(&self, order: &NewOrder) -> storage::Result<Order>;

    /// Move the order to `Cancelled`. Returns `false` if it already was.
    async fn cancel(&self, order_id: &str) -> storage::Result<bool>;

    async fn get(&self, order_id: &str) -> storage::Result<Option<Order>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrderRequest {
    pub user_id: String,
    pub user_email: String,
}

/// Coordinates cart, order persistence and payment.
pub struct OrderSaga {
    carts: Arc<dyn CartClient>,
    payments: Arc<dyn PaymentClient>,
    orders: Arc<dyn OrderStore>,
}

impl OrderSaga {
    pub fn new(
        carts: Arc<dyn CartClient>,
        payments: Arc<dyn PaymentClient>,
        orders: Arc<dyn OrderStore>,
    ) -> Self {
        Self {
            carts,
            payments,
            orders,
        }
    }

    /// Create an order for the user's current cart and charge for it.
    #[tracing::instrument(name = "saga.create_order", skip_all, fields(user_id = %request.user_id))]
    pub async fn create_order(
        &self,
        ctx: &Context,
        request: CreateOrderRequest,
    ) -> Result<Order, Status> {
        if request.user_id.trim().is_empty() {
            return Err(Status::invalid_argument("user id is required"));
        }
        let user_id = request.user_id.as_str();

        ctx.check()?;
        let cart = ctx
            .run(self.carts.get_cart(ctx, user_id))
            .await?
            .map_err(|status| cart_error(status, user_id))?;
        debug!(cart_id = %cart.id, lines = cart.products.len(), "Cart fetched");

        if cart.products.is_empty() {
            return Err(Status::failed_precondition(format!(
                "cart for user {} is empty",
                user_id
            )));
        }
        if cart.total_price <= Decimal::ZERO {
            return Err(Status::failed_precondition(format!(
                "cart for user {} has non-positive total {}",
                user_id, cart.total_price
            )));
        }

        let new_order = NewOrder {
            user_id: user_id.to_string(),
            user_email: request.user_email.clone(),
            total_price: cart.total_price,
            items: cart
                .products
                .iter()
                .map(|p| ProductQuantity {
                    product_id: p.product_id.clone(),
                    quantity: p.quantity,
                })
                .collect(),
        };
        let order = self
            .orders
            .create_with_event(&new_order)
            .await
            .map_err(|err| {
                let status = Status::from(err);
                with_detail(status, &format!("persist order for user {}", user_id))
            })?;
        info!(order_id = %order.id, total = %order.total_price, "Order persisted");

        let payment = match ctx.check() {
            Err(err) => Err(Status::from(err)),
            Ok(()) => match ctx
                .run(self.payments.process_payment(
                    ctx,
                    PaymentRequest {
                        order_id: order.id.clone(),
                        user_id: user_id.to_string(),
                        amount: order.total_price,
                    },
                ))
                .await
            {
                Ok(result) => result,
                Err(err) => Err(Status::from(err)),
            },
        };

        match payment {
            Ok(payment) => {
                info!(order_id = %order.id, payment_id = %payment.id, "Order completed");
                Ok(order)
            }
            Err(status) => {
                warn!(
                    order_id = %order.id,
                    code = ?status.code(),
                    retryable = is_retryable_status(&status),
                    error = %status.message(),
                    "Payment failed, cancelling order"
                );
                self.compensate(&order).await;
                Err(with_detail(
                    status,
                    &format!("payment for order {} (user {})", order.id, user_id),
                ))
            }
        }
    }

    /// Best-effort cancellation. Failures are logged, never returned.
    async fn compensate(&self, order: &Order) {
        match self.orders.cancel(&order.id).await {
            Ok(true) => info!(order_id = %order.id, "Order cancelled"),
            Ok(false) => debug!(order_id = %order.id, "Order already cancelled"),
            Err(err) => error!(
                order_id = %order.id,
                user_id = %order.user_id,
                error = %err,
                "Compensation failed, order left CREATED after failed payment"
            ),
        }
    }
}

/// Cart lookups: a missing cart is a precondition failure, not a lookup error.
fn cart_error(status: Status, user_id: &str) -> Status {
    warn!(
        user_id = %user_id,
        code = ?status.code(),
        retryable = is_retryable_status(&status),
        error = %status.message(),
        "Cart fetch failed"
    );
    match status.code() {
        Code::NotFound => Status::failed_precondition(format!(
            "no cart for user {}: {}",
            user_id,
            status.message()
        )),
        _ => with_detail(status, &format!("fetch cart for user {}", user_id)),
    }
}

/// Keep the code, prefix the message with what was being done.
fn with_detail(status: Status, action: &str) -> Status {
    Status::new(
        status.code(),
        format!("{} failed: {}", action, status.message()),
    )
}

#[cfg(test)]
mod tests;
