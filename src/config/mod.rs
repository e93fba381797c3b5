//! Configuration for marketflow services.
//!
//! Supports YAML file and environment variable overrides.
//!
//! Sources, later wins:
//! 1. `config.yaml` in the working directory (optional)
//! 2. file named by `MARKETFLOW_CONFIG` (required when set)
//! 3. `MARKETFLOW__SECTION__KEY` environment variables

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::bus::BrokerConfig;
use crate::relay::RelayConfig;
use crate::storage::StorageConfig;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MARKETFLOW_CONFIG";
/// Prefix for environment variable overrides.
pub const CONFIG_ENV_PREFIX: &str = "MARKETFLOW";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MARKETFLOW_LOG";

/// The service a worker process runs as.
///
/// Each role owns its own database and consumes a fixed set of events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Owns products and stock; decrements stock on order creation.
    #[default]
    Product,
    /// Owns carts; clears the cart once an order exists.
    Cart,
    /// Owns orders; cancels orders whose stock update failed.
    Order,
    /// Maintains the product search index.
    Search,
    /// Sends order confirmation emails.
    Notification,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 5] = [
        ServiceRole::Product,
        ServiceRole::Cart,
        ServiceRole::Order,
        ServiceRole::Search,
        ServiceRole::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Product => "product",
            ServiceRole::Cart => "cart",
            ServiceRole::Order => "order",
            ServiceRole::Search => "search",
            ServiceRole::Notification => "notification",
        }
    }

    /// Whether this role writes outbox rows and therefore runs a relay.
    pub fn owns_outbox(&self) -> bool {
        matches!(self, ServiceRole::Product | ServiceRole::Order)
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown service role '{}'", s))
    }
}

/// Service identity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub role: ServiceRole,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// `path` adds an explicit file after `config.yaml` and before the
    /// `MARKETFLOW_CONFIG` file.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
