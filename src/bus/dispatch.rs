//! Deadline-bounded delivery dispatch.
//!
//! Every delivery runs its handler on a dedicated task so that a panicking or
//! hung handler still produces a disposition and never blocks the consume loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn, Instrument};

use super::{Delivery, DeliveryHandler, Disposition};
use crate::context::Context;

/// Run `handler` for `delivery` under `deadline` and return the disposition.
///
/// - handler returns → its disposition
/// - handler panics → `DeadLetter` (the same bytes would panic again)
/// - deadline passes → handler cancelled and aborted, `Requeue`
pub async fn dispatch(
    handler: Arc<dyn DeliveryHandler>,
    ctx: &Context,
    delivery: Delivery,
    deadline: Duration,
) -> Disposition {
    let task_ctx = ctx.with_timeout(deadline);
    let span = tracing::info_span!(
        "bus.consume",
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        message_id = ?delivery.message_id,
        redelivered = delivery.redelivered,
    );

    let routing_key = delivery.routing_key.clone();
    let handler_ctx = task_ctx.clone();
    let mut task = tokio::spawn(
        async move { handler.handle(&handler_ctx, &delivery).await }.instrument(span),
    );

    match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(disposition)) => disposition,
        Ok(Err(join_error)) if join_error.is_panic() => {
            error!(routing_key = %routing_key, "Handler panicked, dead-lettering delivery");
            Disposition::DeadLetter
        }
        Ok(Err(join_error)) => {
            warn!(routing_key = %routing_key, error = %join_error, "Handler task aborted, requeueing");
            Disposition::Requeue
        }
        Err(_) => {
            task_ctx.cancel();
            task.abort();
            warn!(
                routing_key = %routing_key,
                deadline_ms = %deadline.as_millis(),
                "Handler exceeded deadline, requeueing"
            );
            Disposition::Requeue
        }
    }
}
