//! Process bootstrap shared by marketflow binaries.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::context::Context;

/// Initialize tracing with the MARKETFLOW_LOG environment variable.
///
/// Defaults to "info" level if MARKETFLOW_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Cancel `ctx` on Ctrl-C.
///
/// Returns when the signal arrives or `ctx` is cancelled elsewhere.
pub async fn cancel_on_ctrl_c(ctx: Context) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(err) => tracing::error!(error = %err, "Failed to listen for Ctrl-C, shutting down"),
            }
            ctx.cancel();
        }
        _ = ctx.done() => {}
    }
}
