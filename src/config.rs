use crate::domain::{Decimal, StrategyConfig, WalletId};
use crate::engine::ApiCredential;
use crate::venue::RetryPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub venue_api_url: String,
    pub network: Network,
    pub wallets: Vec<WalletConfig>,
    pub risk: RiskLimits,
    pub retry: RetryPolicy,
    pub reconcile_tolerance: Decimal,
    pub price_max_age_ms: i64,
    pub price_poll_interval: Duration,
    pub tpsl_poll_interval: Duration,
    pub auth_failure_limit: u32,
    pub strategies_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

/// One funded wallet, keyed by its configuration label.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub id: WalletId,
    pub address: String,
    pub subaccount: Option<String>,
    pub api_key: ApiCredential,
    /// Per-wallet leverage cap.
    pub leverage: u32,
}

/// Global pre-trade limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskLimits {
    pub max_leverage: u32,
    pub min_notional: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_leverage: 20,
            min_notional: Decimal::from_i64(10),
        }
    }
}

/// A strategy to start at boot, read from `STRATEGIES_FILE`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StrategyRequest {
    pub wallet: String,
    pub strategy: StrategyConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = required(&env_map, "DATABASE_PATH")?;
        let venue_api_url = required(&env_map, "VENUE_API_URL")?;

        let network = match env_map
            .get("NETWORK")
            .map(|s| s.as_str())
            .unwrap_or("testnet")
        {
            "mainnet" => Network::Mainnet,
            "testnet" => Network::Testnet,
            other => {
                return Err(ConfigError::InvalidValue(
                    "NETWORK".to_string(),
                    format!("must be mainnet or testnet, got {}", other),
                ))
            }
        };

        let wallets = parse_wallets(&env_map)?;

        let risk = RiskLimits {
            max_leverage: parse_or(&env_map, "MAX_LEVERAGE", 20u32, "must be a positive integer")?,
            min_notional: parse_or(
                &env_map,
                "MIN_NOTIONAL",
                Decimal::from_i64(10),
                "must be a decimal",
            )?,
        };
        if risk.max_leverage == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_LEVERAGE".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let retry = RetryPolicy {
            max_attempts: parse_or(&env_map, "RETRY_MAX_ATTEMPTS", 3u32, "must be a valid u32")?,
            initial_delay: Duration::from_millis(parse_or(
                &env_map,
                "RETRY_INITIAL_DELAY_MS",
                200u64,
                "must be milliseconds",
            )?),
            max_delay: Duration::from_millis(parse_or(
                &env_map,
                "RETRY_MAX_DELAY_MS",
                2000u64,
                "must be milliseconds",
            )?),
            call_timeout: Duration::from_millis(parse_or(
                &env_map,
                "VENUE_CALL_TIMEOUT_MS",
                5000u64,
                "must be milliseconds",
            )?),
        };

        let reconcile_tolerance = parse_or(
            &env_map,
            "RECONCILE_TOLERANCE",
            Decimal::from_str_canonical("0.00000001").unwrap_or_default(),
            "must be a decimal",
        )?;
        if reconcile_tolerance.is_negative() {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_TOLERANCE".to_string(),
                "must not be negative".to_string(),
            ));
        }

        let price_max_age_ms =
            parse_or(&env_map, "PRICE_MAX_AGE_MS", 15_000i64, "must be milliseconds")?;
        let price_poll_interval = Duration::from_millis(parse_or(
            &env_map,
            "PRICE_POLL_INTERVAL_MS",
            2000u64,
            "must be milliseconds",
        )?);
        let tpsl_poll_interval = Duration::from_millis(parse_or(
            &env_map,
            "TPSL_POLL_INTERVAL_MS",
            3000u64,
            "must be milliseconds",
        )?);
        let auth_failure_limit =
            parse_or(&env_map, "AUTH_FAILURE_LIMIT", 3u32, "must be a valid u32")?;

        Ok(Config {
            port,
            database_path,
            venue_api_url,
            network,
            wallets,
            risk,
            retry,
            reconcile_tolerance,
            price_max_age_ms,
            price_poll_interval,
            tpsl_poll_interval,
            auth_failure_limit,
            strategies_file: env_map.get("STRATEGIES_FILE").cloned(),
        })
    }
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    expectation: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), expectation.to_string())),
        None => Ok(default),
    }
}

fn parse_wallets(env_map: &HashMap<String, String>) -> Result<Vec<WalletConfig>, ConfigError> {
    let labels: Vec<String> = required(env_map, "WALLETS")?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if labels.is_empty() {
        return Err(ConfigError::InvalidValue(
            "WALLETS".to_string(),
            "must list at least one wallet".to_string(),
        ));
    }

    let mut wallets = Vec::with_capacity(labels.len());
    for label in labels {
        let prefix = format!("WALLET_{}", label.to_uppercase());
        let address = required(env_map, &format!("{}_ADDRESS", prefix))?;
        let api_key = required(env_map, &format!("{}_API_KEY", prefix))?;
        let subaccount = env_map.get(&format!("{}_SUBACCOUNT", prefix)).cloned();
        let leverage_key = format!("{}_LEVERAGE", prefix);
        let leverage = parse_or(env_map, &leverage_key, 1u32, "must be a positive integer")?;
        if leverage == 0 {
            return Err(ConfigError::InvalidValue(
                leverage_key,
                "must be at least 1".to_string(),
            ));
        }

        if wallets.iter().any(|w: &WalletConfig| w.id.as_str() == label) {
            return Err(ConfigError::InvalidValue(
                "WALLETS".to_string(),
                format!("duplicate wallet {}", label),
            ));
        }
        wallets.push(WalletConfig {
            id: WalletId::new(label),
            address,
            subaccount,
            api_key: ApiCredential::new(api_key),
            leverage,
        });
    }
    Ok(wallets)
}

/// Read boot-time strategy requests from a JSON array file.
pub fn load_strategy_requests(path: &str) -> Result<Vec<StrategyRequest>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| {
        ConfigError::InvalidValue(
            "STRATEGIES_FILE".to_string(),
            "file not found or unreadable".to_string(),
        )
    })?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigError::InvalidValue("STRATEGIES_FILE".to_string(), e.to_string()))
}
