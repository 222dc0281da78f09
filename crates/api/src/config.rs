//! Process configuration
//!
//! Read once at startup. Missing required variables fail fast with the
//! variable's name so a misconfigured deployment never starts serving.

use agencyos_billing::{BillingError, ReconcilerConfig, StripeConfig};
use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error(transparent)]
    Billing(#[from] BillingError),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Apply pending migrations before serving
    pub run_migrations: bool,
    pub stripe: StripeConfig,
    pub reconciler: ReconcilerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let database_max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    name: "DATABASE_MAX_CONNECTIONS",
                    value,
                })?,
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };

        let run_migrations = match std::env::var("RUN_MIGRATIONS") {
            Ok(value) => parse_bool("RUN_MIGRATIONS", value)?,
            Err(_) => true,
        };

        Ok(Self {
            bind_address,
            database_url,
            database_max_connections,
            run_migrations,
            stripe: StripeConfig::from_env()?,
            reconciler: ReconcilerConfig::from_env()?,
        })
    }
}

fn parse_bool(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid { name, value }),
    }
}
