//! End-to-end order flow over the in-process broker.
//!
//! Each service gets its own in-memory database. The order saga writes the
//! order and its outbox row, the relays publish, and the product, cart,
//! notification and order consumers react.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tonic::{Code, Status};

use marketflow::bus::channel::{ChannelBroker, ChannelBrokerConfig};
use marketflow::bus::{Broker, Publication, PublishRetryConfig, ReconnectPolicy};
use marketflow::config::ServiceRole;
use marketflow::consumers::{
    bindings_for, run_consumers, ConsumerDeps, InMemorySearchIndex, RecordingMailer,
};
use marketflow::context::Context;
use marketflow::relay::{MessageRelay, RelayConfig};
use marketflow::saga::{
    CreateOrderRequest, OrderSaga, OrderStatus, OrderStore, Payment, PaymentClient,
    PaymentRequest,
};
use marketflow::storage::sqlite::Product;
use marketflow::storage::{
    memory_pool, OutboxStore, SqliteCartStore, SqliteOrderStore, SqliteOutboxStore,
    SqliteProductStore,
};

struct ApprovingPayment;

#[async_trait]
impl PaymentClient for ApprovingPayment {
    async fn process_payment(
        &self,
        _ctx: &Context,
        request: PaymentRequest,
    ) -> Result<Payment, Status> {
        Ok(Payment {
            id: format!("PAY-{}", request.order_id),
            status: "COMPLETED".to_string(),
        })
    }
}

struct DecliningPayment;

#[async_trait]
impl PaymentClient for DecliningPayment {
    async fn process_payment(
        &self,
        _ctx: &Context,
        _request: PaymentRequest,
    ) -> Result<Payment, Status> {
        Err(Status::failed_precondition("card declined"))
    }
}

/// One database per service role, all on the same broker.
struct Services {
    broker: Arc<ChannelBroker>,
    product_db: SqlitePool,
    cart_db: SqlitePool,
    order_db: SqlitePool,
    mailer: Arc<RecordingMailer>,
    search_index: Arc<InMemorySearchIndex>,
    ctx: Context,
}

impl Services {
    async fn start() -> Self {
        let broker = Arc::new(ChannelBroker::new(ChannelBrokerConfig {
            reconnect: ReconnectPolicy {
                floor: Duration::from_millis(10),
                ceiling: Duration::from_millis(100),
                max_attempts: 20,
            },
            publish: PublishRetryConfig {
                attempts: 3,
                backoff_ms: 10,
            },
            ..ChannelBrokerConfig::default()
        }));
        let services = Self {
            broker,
            product_db: memory_pool().await.unwrap(),
            cart_db: memory_pool().await.unwrap(),
            order_db: memory_pool().await.unwrap(),
            mailer: Arc::new(RecordingMailer::new()),
            search_index: Arc::new(InMemorySearchIndex::new()),
            ctx: Context::background(),
        };

        let notification_db = memory_pool().await.unwrap();
        let search_db = memory_pool().await.unwrap();
        let roles = [
            (ServiceRole::Product, services.product_db.clone()),
            (ServiceRole::Cart, services.cart_db.clone()),
            (ServiceRole::Order, services.order_db.clone()),
            (ServiceRole::Notification, notification_db),
            (ServiceRole::Search, search_db),
        ];
        let mut expected = 0;
        for (role, pool) in roles {
            let deps = ConsumerDeps {
                pool,
                search_index: services.search_index.clone(),
                mailer: services.mailer.clone(),
            };
            let bindings = bindings_for(role, &deps);
            expected += bindings.len();
            let broker: Arc<dyn Broker> = services.broker.clone();
            let ctx = services.ctx.clone();
            tokio::spawn(async move { run_consumers(&ctx, broker, bindings).await });
        }

        let broker = services.broker.clone();
        wait_for(move || {
            let broker = broker.clone();
            async move { broker.declarations().await >= expected }
        })
        .await;
        services
    }

    fn relay(&self, pool: &SqlitePool) -> MessageRelay {
        MessageRelay::new(
            Arc::new(SqliteOutboxStore::new(pool.clone())),
            self.broker.clone(),
            RelayConfig::default(),
        )
    }

    async fn seed_product(&self, id: &str, stock: i64) {
        SqliteProductStore::new(self.product_db.clone())
            .save(&Product {
                id: id.to_string(),
                category_id: "C1".to_string(),
                name: format!("Product {}", id),
                description: String::new(),
                price: Decimal::from_str("9.99").unwrap(),
                stock_quantity: stock,
            })
            .await
            .unwrap();
    }

    async fn stock_of(&self, id: &str) -> i64 {
        SqliteProductStore::new(self.product_db.clone())
            .get(id)
            .await
            .unwrap()
            .unwrap()
            .stock_quantity
    }

    fn saga(&self, payments: Arc<dyn PaymentClient>) -> OrderSaga {
        OrderSaga::new(
            Arc::new(SqliteCartStore::new(self.cart_db.clone())),
            payments,
            Arc::new(SqliteOrderStore::new(self.order_db.clone())),
        )
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

fn request() -> CreateOrderRequest {
    CreateOrderRequest {
        user_id: "U1".to_string(),
        user_email: "u1@example.com".to_string(),
    }
}

#[tokio::test]
async fn test_paid_order_reaches_every_consumer_once() {
    let services = Services::start().await;
    services.seed_product("P1", 10).await;
    let carts = SqliteCartStore::new(services.cart_db.clone());
    carts
        .add_item("U1", "P1", 2, Decimal::from_str("9.99").unwrap())
        .await
        .unwrap();

    let order = services
        .saga(Arc::new(ApprovingPayment))
        .create_order(&Context::background(), request())
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Created);

    let order_relay = services.relay(&services.order_db);
    assert_eq!(order_relay.tick(&Context::background()).await.published, 1);

    let product_db = services.product_db.clone();
    wait_for(move || {
        let products = SqliteProductStore::new(product_db.clone());
        async move { products.get("P1").await.unwrap().unwrap().stock_quantity == 8 }
    })
    .await;
    let mailer = services.mailer.clone();
    wait_for(move || {
        let mailer = mailer.clone();
        async move { mailer.sent().await.len() == 1 }
    })
    .await;
    let cart_db = services.cart_db.clone();
    wait_for(move || {
        let carts = SqliteCartStore::new(cart_db.clone());
        async move { carts.items_for_user("U1").await.unwrap().is_empty() }
    })
    .await;

    // The same message delivered again changes nothing.
    let row = SqliteOutboxStore::new(services.order_db.clone())
        .list()
        .await
        .unwrap()
        .remove(0);
    services
        .broker
        .publish(&Context::background(), MessageRelay::publication_for(&row))
        .await
        .unwrap();
    let broker = services.broker.clone();
    wait_for(move || {
        let broker = broker.clone();
        async move {
            broker.queue_depth("product_queue").await == 0
                && broker.queue_depth("notification_queue").await == 0
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(services.stock_of("P1").await, 8);
    assert_eq!(services.mailer.sent().await.len(), 1);
    assert!(services.broker.dead_letters("product_queue").await.is_empty());
}

#[tokio::test]
async fn test_stock_shortfall_cancels_order() {
    let services = Services::start().await;
    services.seed_product("P1", 10).await;
    let carts = SqliteCartStore::new(services.cart_db.clone());
    let price = Decimal::from_str("1.00").unwrap();
    carts.add_item("U1", "P1", 1, price).await.unwrap();
    carts.add_item("U1", "P2", 1, price).await.unwrap();

    let order = services
        .saga(Arc::new(ApprovingPayment))
        .create_order(&Context::background(), request())
        .await
        .unwrap();

    // Drain product events from catalogue seeding so only the compensation remains.
    let product_outbox = SqliteOutboxStore::new(services.product_db.clone());
    for row in product_outbox.get_unpublished(10).await.unwrap() {
        product_outbox.mark_published(&row.id).await.unwrap();
    }

    services
        .relay(&services.order_db)
        .tick(&Context::background())
        .await;

    let broker = services.broker.clone();
    wait_for(move || {
        let broker = broker.clone();
        async move { broker.dead_letters("product_queue").await.len() == 1 }
    })
    .await;
    assert_eq!(services.stock_of("P1").await, 10);

    let product_relay = services.relay(&services.product_db);
    let stats = product_relay.tick(&Context::background()).await;
    assert_eq!(stats.published, 1);

    let orders = SqliteOrderStore::new(services.order_db.clone());
    let order_id = order.id.clone();
    wait_for(move || {
        let orders = orders.clone();
        let order_id = order_id.clone();
        async move {
            orders.get(&order_id).await.unwrap().unwrap().status == OrderStatus::Cancelled
        }
    })
    .await;
}

#[tokio::test]
async fn test_declined_payment_still_publishes_order_event() {
    let services = Services::start().await;
    let carts = SqliteCartStore::new(services.cart_db.clone());
    carts
        .add_item("U1", "P1", 1, Decimal::from_str("5.00").unwrap())
        .await
        .unwrap();

    let err = services
        .saga(Arc::new(DecliningPayment))
        .create_order(&Context::background(), request())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let outbox = SqliteOutboxStore::new(services.order_db.clone());
    let rows = outbox.list().await.unwrap();
    assert_eq!(rows.len(), 1);
    let order = SqliteOrderStore::new(services.order_db.clone())
        .get(&rows[0].aggregate_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_relay_recovers_from_broker_outage() {
    let services = Services::start().await;
    services.seed_product("P1", 5).await;
    let relay = services.relay(&services.product_db);
    let outbox = SqliteOutboxStore::new(services.product_db.clone());

    services.broker.sever().await;
    let stats = relay.tick(&Context::background()).await;
    assert_eq!(stats.publish_failed, 1);
    assert_eq!(outbox.pending_count().await.unwrap(), 1);

    services.broker.restore().await;
    let stats = relay.tick(&Context::background()).await;
    assert_eq!(stats.published, 1);
    assert_eq!(outbox.pending_count().await.unwrap(), 0);
    assert_eq!(outbox.list().await.unwrap().len(), 1);

    let index = services.search_index.clone();
    wait_for(move || {
        let index = index.clone();
        async move { index.get("P1").await.is_some() }
    })
    .await;
}

#[tokio::test]
async fn test_consumers_resume_after_reconnect() {
    let services = Services::start().await;
    services.seed_product("P1", 10).await;
    let before = services.broker.declarations().await;

    services.broker.sever().await;
    services.broker.wipe_topology().await;
    services.broker.restore().await;

    let broker = services.broker.clone();
    wait_for(move || {
        let broker = broker.clone();
        async move { broker.declarations().await >= before * 2 }
    })
    .await;

    let event = marketflow::events::DomainEvent::OrderCreated(marketflow::events::OrderCreated {
        order_id: "O1".to_string(),
        user_id: "U1".to_string(),
        user_email: "u1@example.com".to_string(),
        products: vec![marketflow::events::ProductQuantity {
            product_id: "P1".to_string(),
            quantity: 2,
        }],
    });
    let publication = Publication::for_event(event.name(), event.to_payload().unwrap())
        .with_message_id("m-1");
    services
        .broker
        .publish(&Context::background(), publication)
        .await
        .unwrap();

    let product_db = services.product_db.clone();
    wait_for(move || {
        let products = SqliteProductStore::new(product_db.clone());
        async move { products.get("P1").await.unwrap().unwrap().stock_quantity == 8 }
    })
    .await;
}
