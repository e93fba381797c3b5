//! Remote collaborators called by the order saga.
//!
//! Errors are `tonic::Status`; the saga relies on their codes to tell
//! "retry later" apart from "will never succeed".

use async_trait::async_trait;
use rust_decimal::Decimal;
use tonic::Status;

use crate::context::Context;

/// One cart line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartProduct {
    pub product_id: String,
    pub quantity: i64,
    pub unit_price: Decimal,
}

/// A user's cart as priced by the cart service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cart {
    pub id: String,
    pub total_price: Decimal,
    pub products: Vec<CartProduct>,
}

impl Cart {
    /// Sum of line totals, or `None` if it does not fit in a `Decimal`.
    pub fn line_total(products: &[CartProduct]) -> Option<Decimal> {
        products.iter().try_fold(Decimal::ZERO, |total, p| {
            p.unit_price
                .checked_mul(Decimal::from(p.quantity))
                .and_then(|line| total.checked_add(line))
        })
    }
}

/// Cart service.
///
/// Errors: `NotFound` (no cart), `Unavailable`/`DeadlineExceeded`
/// (transient), `Internal`.
#[async_trait]
pub trait CartClient: Send + Sync {
    async fn get_cart(&self, ctx: &Context, user_id: &str) -> Result<Cart, Status>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub order_id: String,
    pub user_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: String,
    pub status: String,
}

/// Payment service.
///
/// Errors: `FailedPrecondition` (declined), `InvalidArgument`,
/// `Unavailable`/`DeadlineExceeded` (transient), `Internal`.
#[async_trait]
pub trait PaymentClient: Send + Sync {
    async fn process_payment(
        &self,
        ctx: &Context,
        request: PaymentRequest,
    ) -> Result<Payment, Status>;
}
