//! Order confirmation email on `order_created`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{Applied, Atomicity, EffectError, EventEffect};
use crate::context::Context;
use crate::events::{DomainEvent, EventName, OrderCreated};
use crate::storage::DedupKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail server unavailable: {0}")]
    Unavailable(String),
}

impl From<MailError> for EffectError {
    fn from(err: MailError) -> Self {
        EffectError::Transient(err.to_string())
    }
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, ctx: &Context, email: Email) -> Result<(), MailError>;
}

/// Writes emails to the log instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, _ctx: &Context, email: Email) -> Result<(), MailError> {
        info!(to = %email.to, subject = %email.subject, "Email sent");
        Ok(())
    }
}

/// Keeps sent emails in memory; can be switched offline.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    offline: Mutex<bool>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_offline(&self, offline: bool) {
        *self.offline.lock().await = offline;
    }

    pub async fn sent(&self) -> Vec<Email> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, _ctx: &Context, email: Email) -> Result<(), MailError> {
        if *self.offline.lock().await {
            return Err(MailError::Unavailable("offline".to_string()));
        }
        self.sent.lock().await.push(email);
        Ok(())
    }
}

fn confirmation(order: &OrderCreated) -> Email {
    let lines: Vec<String> = order
        .products
        .iter()
        .map(|p| format!("  {} x {}", p.quantity, p.product_id))
        .collect();
    Email {
        to: order.user_email.clone(),
        subject: format!("Order {} confirmed", order.order_id),
        body: format!(
            "Thank you for your order {}.\n\nItems:\n{}\n",
            order.order_id,
            lines.join("\n")
        ),
    }
}

/// Sends the order confirmation.
pub struct OrderConfirmation {
    mailer: Arc<dyn Mailer>,
}

impl OrderConfirmation {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl EventEffect for OrderConfirmation {
    fn name(&self) -> &'static str {
        "order_confirmation"
    }

    fn accepts(&self, event: EventName) -> bool {
        event == EventName::OrderCreated
    }

    fn atomicity(&self) -> Atomicity {
        Atomicity::BestEffort
    }

    async fn apply(
        &self,
        ctx: &Context,
        _key: Option<&DedupKey>,
        event: &DomainEvent,
    ) -> Result<Applied, EffectError> {
        let DomainEvent::OrderCreated(order) = event else {
            return Err(EffectError::Unsupported(event.name()));
        };
        if order.user_email.trim().is_empty() {
            return Err(EffectError::Invariant(format!(
                "order {} has no recipient",
                order.order_id
            )));
        }

        let sent = ctx.run(self.mailer.send(ctx, confirmation(order))).await;
        match sent {
            Ok(result) => result?,
            Err(e) => return Err(EffectError::Transient(e.to_string())),
        }
        Ok(Applied::Done)
    }
}
