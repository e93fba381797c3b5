//! marketflow-worker: event plumbing for one service role
//!
//! Runs the consumers of the configured role and, for roles that own an
//! outbox (product, order), the outbox relay.
//!
//! ```text
//! [service db] --outbox--> [relay] --publish--> [broker]
//!                                                  |
//! [service db] <--effect + ledger-- [consumers] <--+
//! ```
//!
//! ## Configuration
//! - MARKETFLOW_CONFIG: path to a YAML config file (optional)
//! - MARKETFLOW__SERVICE__ROLE: product | cart | order | search | notification
//! - MARKETFLOW_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use marketflow::bus::init_broker;
use marketflow::config::Config;
use marketflow::consumers::{bindings_for, run_consumers, ConsumerDeps, InMemorySearchIndex, LogMailer};
use marketflow::context::Context;
use marketflow::relay::MessageRelay;
use marketflow::storage::{init_storage, OutboxStore, SqliteOutboxStore};
use marketflow::utils::bootstrap::{cancel_on_ctrl_c, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    let role = config.service.role;

    let pool = init_storage(&config.storage).await?;
    let broker = init_broker(&config.broker)?;

    let ctx = Context::background();
    tokio::spawn(cancel_on_ctrl_c(ctx.clone()));

    let relay = if role.owns_outbox() && config.relay.enabled {
        let outbox: Arc<dyn OutboxStore> = Arc::new(SqliteOutboxStore::new(pool.clone()));
        Some(MessageRelay::new(outbox, broker.clone(), config.relay.clone()).spawn(&ctx))
    } else {
        None
    };

    let deps = ConsumerDeps {
        pool: pool.clone(),
        search_index: Arc::new(InMemorySearchIndex::new()),
        mailer: Arc::new(LogMailer),
    };
    let bindings = bindings_for(role, &deps);

    info!(role = %role, consumers = bindings.len(), relay = relay.is_some(), "marketflow-worker started");

    let result = run_consumers(&ctx, broker, bindings).await;
    ctx.cancel();

    if let Some(relay) = relay {
        relay.stop().await;
    }
    pool.close().await;

    match result {
        Ok(()) => {
            info!(role = %role, "marketflow-worker stopped");
            Ok(())
        }
        Err(e) => {
            error!(role = %role, error = %e, "marketflow-worker failed");
            Err(e.into())
        }
    }
}
