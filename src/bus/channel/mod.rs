//! In-process broker with RabbitMQ semantics.
//!
//! Exchanges route to bound queues (direct, fanout and topic matching),
//! queues dead-letter rejected messages through their configured DLX, a
//! per-consumer prefetch bounds in-flight deliveries, and unacknowledged
//! messages return to their queue when the connection drops.
//!
//! Used for local runs without RabbitMQ and for exercising the relay and
//! consumers under failure: publishes can be made to fail, the connection can
//! be severed and restored, and broker-side topology can be wiped to verify
//! that consumers re-declare it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::reconnect::{retry_publish, retry_transient, ReconnectPolicy};
use super::{
    dispatch, Broker, BrokerConfig, BrokerError, Delivery, DeliveryHandler, Disposition,
    ExchangeKind, Publication, PublishRetryConfig, Result, Subscription,
};
use crate::context::Context;

/// Configuration for the channel broker.
#[derive(Debug, Clone)]
pub struct ChannelBrokerConfig {
    pub prefetch: u16,
    pub handler_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub publish: PublishRetryConfig,
}

impl Default for ChannelBrokerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            handler_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            publish: PublishRetryConfig::default(),
        }
    }
}

impl From<&BrokerConfig> for ChannelBrokerConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            prefetch: config.prefetch,
            handler_timeout: config.handler_timeout(),
            reconnect: config.reconnect_policy(),
            publish: config.publish.clone(),
        }
    }
}

/// Check a routing key against a binding key for the given exchange type.
///
/// Topic rules: words are dot-separated, `*` matches exactly one word and
/// `#` matches zero or more words.
pub fn routing_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self) -> Delivery {
        Delivery {
            body: self.body.clone(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            message_id: self.message_id.clone(),
            redelivered: self.redelivered,
        }
    }
}

struct Queue {
    dead_letter_exchange: Option<String>,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct State {
    connected: bool,
    generation: u64,
    fail_publishes: usize,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    declarations: usize,
    published: usize,
}

impl State {
    fn new() -> Self {
        Self {
            connected: true,
            generation: 0,
            fail_publishes: 0,
            exchanges: HashMap::new(),
            bindings: Vec::new(),
            queues: HashMap::new(),
            unacked: HashMap::new(),
            next_tag: 1,
            declarations: 0,
            published: 0,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::Connection("connection closed".to_string()))
        }
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<()> {
        match self.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Topology(format!(
                "PRECONDITION_FAILED - exchange '{}' declared as {}, requested {}",
                name, existing, kind
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, name: &str, dead_letter_exchange: Option<&str>) -> Result<()> {
        match self.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange.as_deref() != dead_letter_exchange => {
                Err(BrokerError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange' for queue '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    Queue {
                        dead_letter_exchange: dead_letter_exchange.map(str::to_string),
                        ready: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&mut self, queue: &str, exchange: &str, key: &str) -> Result<()> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            key: key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    /// Deliver to every bound queue; returns how many queues received it.
    fn route(&mut self, exchange: &str, message: StoredMessage) -> usize {
        let Some(kind) = self.exchanges.get(exchange).copied() else {
            return 0;
        };
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && routing_matches(kind, &b.key, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();

        let mut routed = 0;
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_one();
                routed += 1;
            }
        }
        routed
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone());
        match dlx {
            Some(dlx) => {
                message.redelivered = false;
                if self.route(&dlx, message) == 0 {
                    warn!(queue = %queue, dlx = %dlx, "Dead letter unroutable, dropped");
                }
            }
            None => warn!(queue = %queue, "Rejected message has no dead-letter exchange, dropped"),
        }
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
            q.notify.notify_one();
        }
    }
}

enum ConsumeExit {
    Cancelled,
    Interrupted(BrokerError),
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChannelBroker {
    state: Arc<Mutex<State>>,
    config: ChannelBrokerConfig,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new(ChannelBrokerConfig::default())
    }
}

impl ChannelBroker {
    pub fn new(config: ChannelBrokerConfig) -> Self {
        info!(prefetch = config.prefetch, "Channel broker initialized");
        Self {
            state: Arc::new(Mutex::new(State::new())),
            config,
        }
    }

    /// Fail the next `n` publish attempts with a transient error. Retries
    /// inside a single `publish` call consume injected failures too.
    pub async fn fail_next_publishes(&self, n: usize) {
        self.state.lock().await.fail_publishes = n;
    }

    /// Drop the connection: consumers are interrupted, unacknowledged
    /// messages return to their queues marked redelivered, and every
    /// operation fails until [`restore`](Self::restore).
    pub async fn sever(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.generation += 1;

        let unacked: Vec<Unacked> = state.unacked.drain().map(|(_, u)| u).collect();
        for Unacked { queue, message } in unacked {
            state.requeue(&queue, message);
        }
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        warn!(generation = state.generation, "Channel broker connection severed");
    }

    pub async fn restore(&self) {
        self.state.lock().await.connected = true;
        info!("Channel broker connection restored");
    }

    /// Forget exchanges and bindings; queues and their messages survive.
    pub async fn wipe_topology(&self) {
        let mut state = self.state.lock().await;
        state.exchanges.clear();
        state.bindings.clear();
    }

    /// Number of completed subscription topology declarations.
    pub async fn declarations(&self) -> usize {
        self.state.lock().await.declarations
    }

    /// Number of messages accepted by `publish`.
    pub async fn published_count(&self) -> usize {
        self.state.lock().await.published
    }

    /// Messages waiting in `queue`.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages currently held by the dead-letter queue of `queue`.
    pub async fn dead_letters(&self, queue: &str) -> Vec<Delivery> {
        self.state
            .lock()
            .await
            .queues
            .get(&super::dead_letter_queue(queue))
            .map(|q| q.ready.iter().map(StoredMessage::to_delivery).collect())
            .unwrap_or_default()
    }

    async fn try_publish(&self, publication: &Publication) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BrokerError::Publish("injected publish failure".to_string()));
        }
        state.declare_exchange(&publication.exchange, publication.kind)?;

        let routed = state.route(
            &publication.exchange,
            StoredMessage {
                exchange: publication.exchange.clone(),
                routing_key: publication.routing_key.clone(),
                body: publication.body.clone(),
                message_id: publication.message_id.clone(),
                redelivered: false,
            },
        );
        state.published += 1;

        debug!(routed, "Published message to channel broker");
        Ok(())
    }

    /// Declare DLX, DLQ, main exchange, main queue and binding, in that order.
    async fn declare_topology(&self, sub: &Subscription) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;

        let dlx = sub.dead_letter_exchange();
        let dlq = sub.dead_letter_queue();
        state.declare_exchange(&dlx, ExchangeKind::Fanout)?;
        state.declare_queue(&dlq, None)?;
        state.bind(&dlq, &dlx, "")?;
        state.declare_exchange(&sub.exchange, sub.kind)?;
        state.declare_queue(&sub.queue, Some(&dlx))?;
        state.bind(&sub.queue, &sub.exchange, &sub.binding_key)?;
        state.declarations += 1;

        debug!(
            exchange = %sub.exchange,
            queue = %sub.queue,
            binding_key = %sub.binding_key,
            "Declared subscription topology"
        );
        Ok(state.generation)
    }

    /// Take the next ready message as an unacknowledged delivery.
    async fn take_ready(
        &self,
        queue: &str,
        generation: u64,
    ) -> std::result::Result<Option<(u64, Delivery)>, BrokerError> {
        let mut state = self.state.lock().await;
        if !state.connected || state.generation != generation {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        let Some(message) = state.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };

        let tag = state.next_tag;
        state.next_tag += 1;
        let delivery = message.to_delivery();
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                message,
            },
        );
        Ok(Some((tag, delivery)))
    }

    async fn queue_notify(&self, queue: &str) -> Option<Arc<Notify>> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.notify))
    }

    async fn settle(&self, tag: u64, disposition: Disposition) {
        let mut state = self.state.lock().await;
        let Some(Unacked { queue, message }) = state.unacked.remove(&tag) else {
            // Returned to the queue by a severed connection; the broker has
            // already scheduled a redelivery.
            debug!(tag, %disposition, "Ignoring settlement on closed connection");
            return;
        };
        match disposition {
            Disposition::Ack => {}
            Disposition::Requeue => state.requeue(&queue, message),
            Disposition::DeadLetter => state.dead_letter(&queue, message),
        }
    }

    async fn consume(
        &self,
        ctx: &Context,
        sub: &Subscription,
        handler: &Arc<dyn DeliveryHandler>,
        generation: u64,
    ) -> ConsumeExit {
        let permits = Arc::new(Semaphore::new(usize::from(self.config.prefetch.max(1))));
        let mut in_flight = JoinSet::new();

        let exit = loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(err) = joined {
                    error!(error = %err, "Delivery task failed");
                }
            }

            let permit = tokio::select! {
                _ = ctx.done() => break ConsumeExit::Cancelled,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break ConsumeExit::Cancelled,
                },
            };

            let Some(notify) = self.queue_notify(&sub.queue).await else {
                break ConsumeExit::Interrupted(BrokerError::Connection(format!(
                    "queue '{}' vanished",
                    sub.queue
                )));
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take_ready(&sub.queue, generation).await {
                Err(err) => break ConsumeExit::Interrupted(err),
                Ok(Some((tag, delivery))) => {
                    let broker = self.clone();
                    let handler = Arc::clone(handler);
                    let task_ctx = ctx.clone();
                    let deadline = self.config.handler_timeout;
                    in_flight.spawn(async move {
                        let disposition = dispatch(handler, &task_ctx, delivery, deadline).await;
                        broker.settle(tag, disposition).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = ctx.done() => break ConsumeExit::Cancelled,
                        _ = &mut notified => {}
                        Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                            if let Err(err) = joined {
                                error!(error = %err, "Delivery task failed");
                            }
                        }
                    }
                }
            }
        };

        // In-flight handlers keep running to their deadline and settle.
        in_flight.detach_all();
        exit
    }
}

#[async_trait]
impl Broker for ChannelBroker {
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
        loop {
            let established = retry_transient(ctx, &self.config.reconnect, "subscribe", || {
                self.declare_topology(&subscription)
            })
            .await;

            let generation = match established {
                Ok(generation) => generation,
                Err(BrokerError::Cancelled) => return Ok(()),
                Err(err) => return Err(err),
            };

            info!(
                queue = %subscription.queue,
                consumer_tag = %subscription.consumer_tag,
                "Consumer connected, processing messages"
            );

            match self.consume(ctx, &subscription, &handler, generation).await {
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
                }
            }
        }
    }
}
