//! AMQP (RabbitMQ) broker implementation.
//!
//! One connection/channel pair per process, opened lazily and swapped out
//! wholesale when it breaks. The channel runs in confirm mode so a publish
//! only succeeds once the broker has taken responsibility for the message.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::reconnect::{retry_publish, retry_transient};
use super::{
    dispatch, Broker, BrokerConfig, BrokerError, Delivery, DeliveryHandler, Disposition,
    ExchangeKind, Publication, Result, Subscription,
};
use crate::context::Context;

const CONTENT_TYPE_JSON: &str = "application/json";
const PERSISTENT: u8 = 2;

struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

enum ConsumeExit {
    Cancelled,
    Interrupted(BrokerError),
}

/// RabbitMQ broker.
///
/// Publishing declares the target exchange and waits for the publisher
/// confirm. Subscribing declares dead-letter and main topology on every
/// (re)connection, sets the prefetch limit and consumes until cancelled.
pub struct AmqpBroker {
    config: BrokerConfig,
    session: RwLock<Option<Arc<Session>>>,
}

impl AmqpBroker {
    /// Create a broker. No connection is made until first use.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            session: RwLock::new(None),
        }
    }

    /// Current session, connecting if there is none or it has closed.
    async fn session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_open() {
                return Ok(Arc::clone(session));
            }
        }

        // Connect without holding the lock so readers are not stalled on
        // network I/O.
        let fresh = Arc::new(self.connect().await?);

        let mut guard = self.session.write().await;
        if let Some(current) = guard.as_ref() {
            if current.is_open() {
                let current = Arc::clone(current);
                drop(guard);
                close_session(&fresh).await;
                return Ok(current);
            }
        }
        *guard = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    async fn connect(&self) -> Result<Session> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| classify(e, "connect"))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| classify(e, "create channel"))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify(e, "enable publisher confirms"))?;

        info!(url = %self.config.url, "Connected to AMQP");
        Ok(Session {
            connection,
            channel,
        })
    }

    /// Drop `stale` if it is still the current session.
    async fn invalidate(&self, stale: &Arc<Session>) {
        let mut guard = self.session.write().await;
        if guard
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, stale))
        {
            *guard = None;
            debug!("Discarded broken AMQP session");
        }
    }

    /// Close the shared connection, if any.
    pub async fn close(&self) {
        if let Some(session) = self.session.write().await.take() {
            close_session(&session).await;
            info!("AMQP connection closed");
        }
    }

    async fn try_publish(&self, publication: &Publication) -> Result<()> {
        let session = self.session().await?;
        let outcome = publish_on(&session.channel, publication).await;
        if let Err(err) = &outcome {
            if err.is_transient() && !session.is_open() {
                self.invalidate(&session).await;
            }
        }
        outcome
    }

    /// Declare topology on a fresh or current session and open the consumer.
    async fn open_consumer(&self, sub: &Subscription) -> Result<(Arc<Session>, Consumer)> {
        let session = self.session().await?;
        match declare_and_consume(&session.channel, sub, self.config.prefetch).await {
            Ok(consumer) => Ok((session, consumer)),
            Err(err) => {
                // Topology errors close the channel; either way the next
                // attempt needs a fresh session.
                self.invalidate(&session).await;
                Err(err)
            }
        }
    }

    async fn consume(
        &self,
        ctx: &Context,
        handler: &Arc<dyn DeliveryHandler>,
        mut consumer: Consumer,
    ) -> ConsumeExit {
        let mut in_flight = JoinSet::new();

        let exit = loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(err) = joined {
                    error!(error = %err, "Delivery task failed");
                }
            }

            let next = tokio::select! {
                _ = ctx.done() => break ConsumeExit::Cancelled,
                next = consumer.next() => next,
            };

            let delivery = match next {
                None => {
                    break ConsumeExit::Interrupted(BrokerError::Connection(
                        "consumer stream ended".to_string(),
                    ))
                }
                Some(Err(err)) => break ConsumeExit::Interrupted(classify(err, "consume")),
                Some(Ok(delivery)) => delivery,
            };

            let message_id = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string());
            let message = Delivery {
                body: delivery.data,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                message_id,
                redelivered: delivery.redelivered,
            };
            let acker = delivery.acker;

            let handler = Arc::clone(handler);
            let task_ctx = ctx.clone();
            let deadline = self.config.handler_timeout();
            in_flight.spawn(async move {
                let disposition = dispatch(handler, &task_ctx, message, deadline).await;
                settle(&acker, disposition).await;
            });
        };

        // In-flight handlers still settle on their own; if the channel is
        // gone the broker has already requeued their deliveries.
        in_flight.detach_all();
        exit
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(exchange = %publication.exchange, routing_key = %publication.routing_key))]
    async fn publish(&self, ctx: &Context, publication: Publication) -> Result<()> {
        ctx.check().map_err(|_| BrokerError::Cancelled)?;
        retry_publish(ctx, &self.config.publish, || self.try_publish(&publication)).await
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        subscription: Subscription,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        let policy = self.config.reconnect_policy();

        loop {
            let established = retry_transient(ctx, &policy, "subscribe", || {
                self.open_consumer(&subscription)
            })
            .await;

            let (session, consumer) = match established {
                Ok(opened) => opened,
                Err(BrokerError::Cancelled) => return Ok(()),
                Err(err) => return Err(err),
            };

            info!(
                queue = %subscription.queue,
                consumer_tag = %subscription.consumer_tag,
                prefetch = self.config.prefetch,
                "Consumer connected, processing messages"
            );

            match self.consume(ctx, &handler, consumer).await {
                ConsumeExit::Cancelled => {
                    info!(consumer_tag = %subscription.consumer_tag, "Consumer stopped");
                    return Ok(());
                }
                ConsumeExit::Interrupted(err) => {
                    warn!(
                        consumer_tag = %subscription.consumer_tag,
                        error = %err,
                        "Consumer interrupted, reconnecting"
                    );
                    self.invalidate(&session).await;
                }
            }
        }
    }
}

async fn publish_on(channel: &Channel, publication: &Publication) -> Result<()> {
    declare_exchange(channel, &publication.exchange, publication.kind).await?;

    let mut properties = BasicProperties::default()
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_delivery_mode(PERSISTENT);
    if let Some(id) = &publication.message_id {
        properties = properties.with_message_id(id.as_str().into());
    }

    let confirm = channel
        .basic_publish(
            &publication.exchange,
            &publication.routing_key,
            BasicPublishOptions::default(),
            &publication.body,
            properties,
        )
        .await
        .map_err(|e| classify(e, "publish"))?;

    let confirmation = confirm.await.map_err(|e| classify(e, "publish confirm"))?;
    if confirmation.is_nack() {
        return Err(BrokerError::Publish("broker nacked publish".to_string()));
    }

    debug!(
        exchange = %publication.exchange,
        routing_key = %publication.routing_key,
        "Published message"
    );
    Ok(())
}

/// Declare DLX, DLQ, main exchange, main queue and binding, then consume.
async fn declare_and_consume(
    channel: &Channel,
    sub: &Subscription,
    prefetch: u16,
) -> Result<Consumer> {
    let dlx = sub.dead_letter_exchange();
    let dlq = sub.dead_letter_queue();

    declare_exchange(channel, &dlx, ExchangeKind::Fanout).await?;
    declare_queue(channel, &dlq, FieldTable::default()).await?;
    bind(channel, &dlq, &dlx, "").await?;

    declare_exchange(channel, &sub.exchange, sub.kind).await?;
    declare_queue(channel, &sub.queue, dead_letter_args(&dlx)).await?;
    bind(channel, &sub.queue, &sub.exchange, &sub.binding_key).await?;

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| classify(e, "set prefetch"))?;

    let consumer = channel
        .basic_consume(
            &sub.queue,
            &sub.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify(e, "start consumer"))?;

    info!(
        exchange = %sub.exchange,
        queue = %sub.queue,
        dead_letter_queue = %dlq,
        binding_key = %sub.binding_key,
        "Declared subscription topology"
    );
    Ok(consumer)
}

async fn declare_exchange(channel: &Channel, name: &str, kind: ExchangeKind) -> Result<()> {
    channel
        .exchange_declare(
            name,
            lapin_kind(kind),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify(e, "declare exchange"))
}

async fn declare_queue(channel: &Channel, name: &str, args: FieldTable) -> Result<()> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .map(|_| ())
        .map_err(|e| classify(e, "declare queue"))
}

async fn bind(channel: &Channel, queue: &str, exchange: &str, key: &str) -> Result<()> {
    channel
        .queue_bind(
            queue,
            exchange,
            key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify(e, "bind queue"))
}

async fn settle(acker: &Acker, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => acker.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
        Disposition::DeadLetter => {
            acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
        }
    };
    if let Err(err) = result {
        warn!(%disposition, error = %err, "Failed to settle delivery");
    }
}

async fn close_session(session: &Session) {
    if let Err(err) = session.connection.close(200, "normal shutdown").await {
        debug!(error = %err, "Error closing AMQP connection");
    }
}

fn dead_letter_args(dlx: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(dlx.into()),
    );
    args
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

/// Map a lapin error onto the retry taxonomy.
///
/// Access refused, not found and precondition failed mean the broker
/// rejected what was asked for; retrying the same request cannot succeed.
fn classify(err: lapin::Error, action: &str) -> BrokerError {
    if let lapin::Error::ProtocolError(amqp) = &err {
        if matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(
                AMQPSoftError::ACCESSREFUSED
                    | AMQPSoftError::NOTFOUND
                    | AMQPSoftError::PRECONDITIONFAILED
            )
        ) {
            return BrokerError::Topology(format!("{} rejected: {}", action, err));
        }
    }
    BrokerError::Connection(format!("{} failed: {}", action, err))
}
