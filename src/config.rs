use serde::Deserialize;
use std::time::Duration;

use crate::chain::EvmConfig;
use crate::error::{AppError, AppResult};
use crate::middleware::AuthConfig;
use crate::settlement::SettlementConfig;

const CELO_SEPOLIA_RPC: &str = "https://forno.celo-sepolia.celo-testnet.org";
const CELO_SEPOLIA_CHAIN_ID: u64 = 11142220;

/// Service configuration, read from the environment (after `.env`)
#[derive(Deserialize, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: Option<String>,
    pub db_max_connections: u32,

    pub cron_secret_key: Option<String>,
    pub api_key: Option<String>,

    pub rpc_url: String,
    pub chain_id: u64,
    pub raffle_contract_address: String,
    pub agent_private_key: String,
    pub receipt_timeout_secs: u64,
    pub gas_headroom_percent: u64,

    pub settlement_lease_secs: i64,
    /// 0 disables the in-process scheduler
    pub settlement_interval_secs: u64,

    /// Comma separated
    pub cors_origins: String,
    pub rate_limit_per_minute: u32,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Self::from_source(config::Environment::default())
    }

    fn from_source(env: config::Environment) -> AppResult<Self> {
        let settings = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")
            .and_then(|b| b.set_default("db_max_connections", 20))
            .and_then(|b| b.set_default("rpc_url", CELO_SEPOLIA_RPC))
            .and_then(|b| b.set_default("chain_id", CELO_SEPOLIA_CHAIN_ID as i64))
            .and_then(|b| b.set_default("receipt_timeout_secs", 120))
            .and_then(|b| b.set_default("gas_headroom_percent", 20))
            .and_then(|b| b.set_default("settlement_lease_secs", 600))
            .and_then(|b| b.set_default("settlement_interval_secs", 0))
            .and_then(|b| b.set_default("cors_origins", ""))
            .and_then(|b| b.set_default("rate_limit_per_minute", 120))
            .map_err(config_error)?
            .add_source(env)
            .build()
            .map_err(config_error)?;

        let config: Config = settings.try_deserialize().map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.settlement_lease_secs <= 0 {
            return Err(AppError::Config(
                "SETTLEMENT_LEASE_SECS must be positive".to_string(),
            ));
        }
        if self.receipt_timeout_secs == 0 {
            return Err(AppError::Config(
                "RECEIPT_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `None` (or empty) selects the in-memory store
    pub fn database_url(&self) -> Option<&str> {
        non_empty(&self.database_url)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn evm(&self) -> EvmConfig {
        EvmConfig {
            rpc_url: self.rpc_url.clone(),
            chain_id: self.chain_id,
            contract_address: self.raffle_contract_address.clone(),
            private_key: self.agent_private_key.clone(),
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            gas_headroom_percent: self.gas_headroom_percent,
        }
    }

    pub fn settlement(&self) -> SettlementConfig {
        SettlementConfig {
            lease_ttl: chrono::Duration::seconds(self.settlement_lease_secs),
        }
    }

    pub fn auth(&self) -> AuthConfig {
        AuthConfig {
            cron_secret: non_empty(&self.cron_secret_key).map(str::to_string),
            api_key: non_empty(&self.api_key).map(str::to_string),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn config_error(error: config::ConfigError) -> AppError {
    AppError::Config(error.to_string())
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database", &self.database_url().map(|_| "<set>"))
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("raffle_contract_address", &self.raffle_contract_address)
            .field("settlement_interval_secs", &self.settlement_interval_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> config::Environment {
        let map: config::Map<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default().source(Some(map))
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("RAFFLE_CONTRACT_ADDRESS", "0x1111111111111111111111111111111111111111"),
        (
            "AGENT_PRIVATE_KEY",
            "4646464646464646464646464646464646464646464646464646464646464646",
        ),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_source(env(&REQUIRED)).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.chain_id, 11142220);
        assert_eq!(config.rpc_url, CELO_SEPOLIA_RPC);
        assert_eq!(config.settlement_interval_secs, 0);
        assert!(config.database_url().is_none());
        assert!(config.cors_origins().is_empty());
        assert_eq!(config.settlement().lease_ttl, chrono::Duration::minutes(10));
        // The key stays a string even though it is all digits
        assert_eq!(config.evm().private_key, REQUIRED[1].1);
    }

    #[test]
    fn test_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("CHAIN_ID", "42220"),
            ("DATABASE_URL", "postgres://localhost/raffleup"),
            ("CORS_ORIGINS", "http://localhost:3000, https://raffleup.app"),
            ("CRON_SECRET_KEY", "  "),
            ("API_KEY", "admin"),
        ]);
        let config = Config::from_source(env(&pairs)).unwrap();

        assert_eq!(config.chain_id, 42220);
        assert_eq!(config.database_url(), Some("postgres://localhost/raffleup"));
        assert_eq!(
            config.cors_origins(),
            vec!["http://localhost:3000".to_string(), "https://raffleup.app".to_string()]
        );
        let auth = config.auth();
        assert!(auth.cron_secret.is_none());
        assert_eq!(auth.api_key.as_deref(), Some("admin"));
    }

    #[test]
    fn test_missing_contract_is_an_error() {
        let result = Config::from_source(env(&REQUIRED[1..]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_receipt_timeout_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RECEIPT_TIMEOUT_SECS", "0"));
        let result = Config::from_source(env(&pairs));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let config = Config::from_source(env(&REQUIRED)).unwrap();
        assert!(!format!("{:?}", config).contains("46464646"));
    }
}
