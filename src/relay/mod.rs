//! Outbox relay.
//!
//! Polls the local outbox on a fixed interval and publishes each pending row,
//! marking it published only after the broker accepted it. A row whose
//! publish fails stays pending for the next tick; a row whose status update
//! fails is published again later, which consumers absorb through the ledger.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::bus::{Broker, ExchangeKind, Publication};
use crate::context::Context;
use crate::events::exchange_for;
use crate::storage::{OutboxEvent, OutboxStore};

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Run the relay in roles that own an outbox.
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Rows fetched per tick.
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1_000,
            batch_size: 100,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub fetched: usize,
    pub published: usize,
    /// Publish failed; row left pending.
    pub publish_failed: usize,
    /// Published but the status update failed; row will be published again.
    pub mark_failed: usize,
}

/// Publishes outbox rows through a broker.
pub struct MessageRelay {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: RelayConfig,
}

impl MessageRelay {
    pub fn new(outbox: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        Self {
            outbox,
            broker,
            config,
        }
    }

    /// Broker message for an outbox row.
    pub fn publication_for(row: &OutboxEvent) -> Publication {
        Publication::new(
            exchange_for(&row.event_name),
            ExchangeKind::Direct,
            row.event_name.clone(),
            row.payload.clone(),
        )
        .with_message_id(row.id.clone())
    }

    /// Publish one batch of pending rows, oldest first.
    ///
    /// Rows are handled independently. Stops early, without error, once
    /// `ctx` ends.
    pub async fn tick(&self, ctx: &Context) -> RelayStats {
        let mut stats = RelayStats::default();
        if ctx.is_done() {
            return stats;
        }

        let rows = match self.outbox.get_unpublished(self.config.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Failed to read outbox, retrying next tick");
                return stats;
            }
        };
        stats.fetched = rows.len();

        for row in rows {
            if ctx.is_done() {
                debug!("Relay cancelled mid-batch");
                break;
            }

            if let Err(e) = self
                .broker
                .publish(ctx, Self::publication_for(&row))
                .await
            {
                warn!(
                    id = %row.id,
                    event_name = %row.event_name,
                    error = %e,
                    "Failed to publish outbox row, left pending"
                );
                stats.publish_failed += 1;
                continue;
            }

            match self.outbox.mark_published(&row.id).await {
                Ok(()) => stats.published += 1,
                Err(e) => {
                    error!(
                        id = %row.id,
                        event_name = %row.event_name,
                        error = %e,
                        "Published but failed to mark outbox row, it will be published again"
                    );
                    stats.mark_failed += 1;
                }
            }
        }

        if stats.fetched > 0 {
            info!(
                fetched = stats.fetched,
                published = stats.published,
                publish_failed = stats.publish_failed,
                mark_failed = stats.mark_failed,
                "Relay tick"
            );
        }
        stats
    }

    /// Tick on the poll interval until `ctx` ends.
    ///
    /// A slow tick delays the next one; ticks never overlap.
    pub async fn run(&self, ctx: &Context) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                _ = ctx.done() => break,
                _ = interval.tick() => {
                    self.tick(ctx).instrument(tracing::info_span!("relay.tick")).await;
                }
            }
        }

        match self.outbox.pending_count().await {
            Ok(pending) => info!(pending, "Outbox relay stopped"),
            Err(_) => info!("Outbox relay stopped"),
        }
    }

    /// Run on a background task owned by the returned handle.
    pub fn spawn(self, ctx: &Context) -> RelayHandle {
        let ctx = ctx.child();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { self.run(&task_ctx).await });
        RelayHandle { ctx, task }
    }
}

/// Handle to a spawned relay.
pub struct RelayHandle {
    ctx: Context,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop the relay and wait for the current tick to wind down.
    pub async fn stop(self) {
        self.ctx.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Outbox relay task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
