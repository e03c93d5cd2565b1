use crate::errors::StartupError;
use crate::id::{DEFAULT_NODE, MAX_NODE};
use crate::middleware::{AdmissionConfig, BreakerConfig, Endpoint, PerEndpoint};
use crate::models::SystemAccounts;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File};
use ledger_core::{AccountId, DatabaseConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub id: IdConfig,
    /// Currency code → system account id
    #[serde(default)]
    pub system_accounts: HashMap<String, String>,
    pub limits: PerEndpoint<AdmissionConfig>,
    pub breakers: PerEndpoint<BreakerConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdConfig {
    pub node_id: u16,
}

impl Config {
    /// Defaults, then the optional config file, then the environment
    pub fn from_env() -> Result<Self, StartupError> {
        let path =
            env::var("ACCOUNT_SERVICE_CONFIG").unwrap_or_else(|_| "config/account-service".into());

        let mut builder = Self::defaults()?
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("ACCOUNT_SERVICE").separator("__"));

        if let Ok(port) = env::var("SERVICE_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let database = DatabaseConfig::default();
        let limit = AdmissionConfig::default();
        let breaker = BreakerConfig::default();

        let mut builder = config::Config::builder()
            // Server defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            // Database defaults
            .set_default("database.url", database.url)?
            .set_default("database.max_connections", i64::from(database.max_connections))?
            .set_default(
                "database.acquire_timeout_secs",
                database.acquire_timeout_secs as i64,
            )?
            .set_default("id.node_id", i64::from(DEFAULT_NODE))?;

        for endpoint in Endpoint::ALL {
            let limits = format!("limits.{}", endpoint);
            builder = builder
                .set_default(format!("{}.slo_ms", limits), limit.slo_ms as i64)?
                .set_default(format!("{}.rate", limits), i64::from(limit.rate))?
                .set_default(format!("{}.burst", limits), i64::from(limit.burst))?;

            let breakers = format!("breakers.{}", endpoint);
            builder = builder
                .set_default(format!("{}.failure_ratio", breakers), breaker.failure_ratio)?
                .set_default(format!("{}.window", breakers), breaker.window as i64)?
                .set_default(format!("{}.min_calls", breakers), breaker.min_calls as i64)?
                .set_default(format!("{}.cooldown_ms", breakers), breaker.cooldown_ms as i64)?
                .set_default(
                    format!("{}.half_open_trials", breakers),
                    i64::from(breaker.half_open_trials),
                )?;
        }

        Ok(builder)
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        if self.id.node_id > MAX_NODE {
            return Err(StartupError::Config(format!(
                "id.node_id must be at most {}",
                MAX_NODE
            )));
        }
        for (endpoint, breaker) in self.breakers.iter() {
            breaker.validate(endpoint)?;
        }
        self.system_accounts()?;
        Ok(())
    }

    /// Parsed system account map with upper-cased currency keys
    pub fn system_accounts(&self) -> Result<SystemAccounts, StartupError> {
        self.system_accounts
            .iter()
            .map(|(currency, id)| {
                let parsed: AccountId = id.parse().map_err(|_| {
                    StartupError::Config(format!(
                        "system_accounts.{}: `{}` is not an account id",
                        currency, id
                    ))
                })?;
                if parsed.is_zero() {
                    return Err(StartupError::Config(format!(
                        "system_accounts.{}: zero is not an account id",
                        currency
                    )));
                }
                Ok((currency.to_ascii_uppercase(), parsed))
            })
            .collect()
    }
}
