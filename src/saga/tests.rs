use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::*;
use crate::storage::mock::MockOrderStore;
use crate::storage::{
    memory_pool, OutboxStore, SqliteCartStore, SqliteOrderStore, SqliteOutboxStore,
};
use crate::utils::retry::is_retryable_status;

/// Cart client returning a fixed answer.
struct ScriptedCart {
    answer: Result<Cart, Status>,
    calls: AtomicUsize,
}

impl ScriptedCart {
    fn returning(answer: Result<Cart, Status>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CartClient for ScriptedCart {
    async fn get_cart(&self, _ctx: &Context, _user_id: &str) -> Result<Cart, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Payment client returning a fixed answer and recording requests.
struct ScriptedPayment {
    answer: Result<Payment, Status>,
    requests: Mutex<Vec<PaymentRequest>>,
}

impl ScriptedPayment {
    fn approving() -> Arc<Self> {
        Self::returning(Ok(Payment {
            id: "PAY-1".to_string(),
            status: "COMPLETED".to_string(),
        }))
    }

    fn returning(answer: Result<Payment, Status>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<PaymentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentClient for ScriptedPayment {
    async fn process_payment(
        &self,
        _ctx: &Context,
        request: PaymentRequest,
    ) -> Result<Payment, Status> {
        self.requests.lock().unwrap().push(request);
        self.answer.clone()
    }
}

/// Cart client that cancels the caller's context after answering.
struct CancellingCart {
    cart: Cart,
}

#[async_trait]
impl CartClient for CancellingCart {
    async fn get_cart(&self, ctx: &Context, _user_id: &str) -> Result<Cart, Status> {
        ctx.cancel();
        Ok(self.cart.clone())
    }
}

fn cart() -> Cart {
    let products = vec![CartProduct {
        product_id: "P1".to_string(),
        quantity: 2,
        unit_price: Decimal::new(999, 2),
    }];
    Cart {
        id: "CART-1".to_string(),
        total_price: Cart::line_total(&products).unwrap(),
        products,
    }
}

fn request() -> CreateOrderRequest {
    CreateOrderRequest {
        user_id: "U1".to_string(),
        user_email: "u1@example.com".to_string(),
    }
}

#[tokio::test]
async fn test_successful_order_is_created_and_paid() {
    let pool = memory_pool().await.unwrap();
    let orders = Arc::new(SqliteOrderStore::new(pool.clone()));
    let payments = ScriptedPayment::approving();
    let saga = OrderSaga::new(ScriptedCart::returning(Ok(cart())), payments.clone(), orders.clone());

    let order = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(order.total_price, Decimal::new(1998, 2));
    assert_eq!(order.items.len(), 1);

    let charged = payments.requests();
    assert_eq!(charged.len(), 1);
    assert_eq!(charged[0].order_id, order.id);
    assert_eq!(charged[0].amount, Decimal::new(1998, 2));

    let stored = orders.get(&order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Created);

    let outbox = SqliteOutboxStore::new(pool);
    let pending = outbox.get_unpublished(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].aggregate_id, order.id);
}

#[tokio::test]
async fn test_declined_payment_cancels_order() {
    let pool = memory_pool().await.unwrap();
    let orders = Arc::new(SqliteOrderStore::new(pool.clone()));
    let payments =
        ScriptedPayment::returning(Err(Status::failed_precondition("insufficient funds")));
    let saga = OrderSaga::new(ScriptedCart::returning(Ok(cart())), payments.clone(), orders.clone());

    let err = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.message().contains("insufficient funds"));
    assert!(err.message().contains("U1"));
    assert!(!is_retryable_status(&err));

    let order_id = payments.requests()[0].order_id.clone();
    let stored = orders.get(&order_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);

    // The order_created row was already committed and still goes out.
    let outbox = SqliteOutboxStore::new(pool);
    assert_eq!(outbox.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_compensation_still_returns_payment_error() {
    let orders = Arc::new(MockOrderStore::new());
    orders.set_fail_on_cancel(true).await;
    let payments = ScriptedPayment::returning(Err(Status::unavailable("payment down")));
    let saga = OrderSaga::new(ScriptedCart::returning(Ok(cart())), payments.clone(), orders.clone());

    let err = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert!(is_retryable_status(&err));
    let order_id = payments.requests()[0].order_id.clone();
    let stored = orders.get(&order_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Created);
}

#[tokio::test]
async fn test_missing_user_id_is_rejected_before_any_call() {
    let carts = ScriptedCart::returning(Ok(cart()));
    let orders = Arc::new(MockOrderStore::new());
    let saga = OrderSaga::new(carts.clone(), ScriptedPayment::approving(), orders.clone());

    let err = saga
        .create_order(
            &Context::background(),
            CreateOrderRequest {
                user_id: "  ".to_string(),
                user_email: String::new(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(carts.calls(), 0);
    assert_eq!(orders.len().await, 0);
}

#[tokio::test]
async fn test_missing_cart_is_a_failed_precondition() {
    let orders = Arc::new(MockOrderStore::new());
    let payments = ScriptedPayment::approving();
    let saga = OrderSaga::new(
        ScriptedCart::returning(Err(Status::not_found("no cart"))),
        payments.clone(),
        orders.clone(),
    );

    let err = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(orders.len().await, 0);
    assert!(payments.requests().is_empty());
}

#[tokio::test]
async fn test_empty_cart_creates_nothing() {
    let orders = Arc::new(MockOrderStore::new());
    let empty = Cart {
        id: "CART-1".to_string(),
        total_price: Decimal::ZERO,
        products: vec![],
    };
    let saga = OrderSaga::new(
        ScriptedCart::returning(Ok(empty)),
        ScriptedPayment::approving(),
        orders.clone(),
    );

    let err = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(orders.len().await, 0);
}

#[tokio::test]
async fn test_cart_outage_keeps_transient_code() {
    let orders = Arc::new(MockOrderStore::new());
    let saga = OrderSaga::new(
        ScriptedCart::returning(Err(Status::unavailable("cart down"))),
        ScriptedPayment::approving(),
        orders.clone(),
    );

    let err = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().contains("cart down"));
    assert!(is_retryable_status(&err));
    assert_eq!(orders.len().await, 0);
}

#[tokio::test]
async fn test_persist_failure_skips_payment() {
    let orders = Arc::new(MockOrderStore::new());
    orders.set_fail_on_create(true).await;
    let payments = ScriptedPayment::approving();
    let saga = OrderSaga::new(ScriptedCart::returning(Ok(cart())), payments.clone(), orders);

    let err = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert!(payments.requests().is_empty());
}

#[tokio::test]
async fn test_cancellation_after_persist_compensates() {
    let orders = Arc::new(MockOrderStore::new());
    let payments = ScriptedPayment::approving();
    let saga = OrderSaga::new(Arc::new(CancellingCart { cart: cart() }), payments.clone(), orders.clone());

    let ctx = Context::background();
    let err = saga.create_order(&ctx, request()).await.unwrap_err();

    assert_eq!(err.code(), Code::Cancelled);
    assert!(payments.requests().is_empty());
    assert_eq!(orders.len().await, 1);
}

#[tokio::test]
async fn test_cancelled_context_short_circuits() {
    let carts = ScriptedCart::returning(Ok(cart()));
    let saga = OrderSaga::new(
        carts.clone(),
        ScriptedPayment::approving(),
        Arc::new(MockOrderStore::new()),
    );

    let ctx = Context::background();
    ctx.cancel();
    let err = saga.create_order(&ctx, request()).await.unwrap_err();

    assert_eq!(err.code(), Code::Cancelled);
    assert_eq!(carts.calls(), 0);
}

#[test]
fn test_line_total_reports_overflow() {
    let line = |quantity, unit_price| CartProduct {
        product_id: "P1".to_string(),
        quantity,
        unit_price,
    };

    assert_eq!(Cart::line_total(&[]), Some(Decimal::ZERO));
    assert_eq!(
        Cart::line_total(&[line(2, Decimal::new(999, 2)), line(1, Decimal::new(500, 2))]),
        Some(Decimal::new(2498, 2))
    );
    assert_eq!(Cart::line_total(&[line(i64::MAX, Decimal::MAX)]), None);
    assert_eq!(
        Cart::line_total(&[line(1, Decimal::MAX), line(1, Decimal::MAX)]),
        None
    );
}

#[tokio::test]
async fn test_unpriceable_cart_fails_without_order() {
    let pool = memory_pool().await.unwrap();
    let carts = Arc::new(SqliteCartStore::new(pool));
    carts
        .add_item("U1", "P1", i64::MAX, Decimal::from(100_000_000_000i64))
        .await
        .unwrap();
    let orders = Arc::new(MockOrderStore::new());
    let payments = ScriptedPayment::approving();
    let saga = OrderSaga::new(carts, payments.clone(), orders.clone());

    let err = saga
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Internal);
    assert!(!is_retryable_status(&err));
    assert_eq!(orders.len().await, 0);
    assert!(payments.requests().is_empty());
}
