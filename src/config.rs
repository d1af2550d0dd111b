use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RelayerError;

/// Lease given to a claimed item unless configured otherwise
pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);

/// Sequential ledger round-trips in one attempt: call, gas estimate, send.
const LEDGER_ROUND_TRIPS: u32 = 3;

/// Signing key material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Configuration for the relayer service and pool
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Ledger JSON-RPC endpoint
    pub rpc_url: String,
    /// Contract receiving the record calls
    pub contract_address: String,
    /// Chain id used when signing
    pub chain_id: u64,
    /// One key per signing wallet
    pub private_keys: Vec<SecretKey>,
    /// Queue database location
    pub database_url: String,
    /// Base tick interval of every relay loop
    pub poll_interval: Duration,
    /// Extra period added per wallet index to stagger the pool
    pub wallet_skew: Duration,
    /// Maximum items drained by one scheduled job
    pub batch_ceiling: usize,
    /// How long terminal items are kept before the sweep deletes them
    pub retention: Duration,
    /// Consecutive failures after which a wallet stops being scheduled
    pub error_ceiling: u32,
    /// Timeout applied to every ledger call
    pub rpc_timeout: Duration,
    /// How long a claimed item stays leased before another worker may take it
    pub lease_duration: Duration,
    /// Period of the background retention sweep
    pub sweep_interval: Duration,
    /// Maximum attempts per item; 1 disables requeueing
    pub max_retry_attempts: u32,
    /// Whether the background sweep runs at all
    pub enable_auto_pruning: bool,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            contract_address: String::new(),
            chain_id: 1,
            private_keys: Vec::new(),
            database_url: "sqlite://relayer.db?mode=rwc".into(),
            poll_interval: Duration::from_millis(1500),
            wallet_skew: Duration::from_millis(250),
            batch_ceiling: 20,
            retention: Duration::from_secs(3600),
            error_ceiling: 5,
            rpc_timeout: Duration::from_secs(30),
            lease_duration: DEFAULT_LEASE,
            sweep_interval: Duration::from_secs(300),
            max_retry_attempts: 1,
            enable_auto_pruning: true,
        }
    }
}

impl RelayerConfig {
    /// Load from `RELAYER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, RelayerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(&format!("RELAYER_{key}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = get("RPC_URL") {
            config.rpc_url = url;
        }
        if let Some(address) = get("CONTRACT_ADDRESS") {
            config.contract_address = address;
        }
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(keys) = get("PRIVATE_KEYS") {
            config.private_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(SecretKey::new)
                .collect();
        }
        if let Some(raw) = get("CHAIN_ID") {
            config.chain_id = parse_value("CHAIN_ID", &raw)?;
        }
        if let Some(raw) = get("POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_value("POLL_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = get("WALLET_SKEW_MS") {
            config.wallet_skew = Duration::from_millis(parse_value("WALLET_SKEW_MS", &raw)?);
        }
        if let Some(raw) = get("BATCH_CEILING") {
            config.batch_ceiling = parse_value("BATCH_CEILING", &raw)?;
        }
        if let Some(raw) = get("RETENTION_SECS") {
            config.retention = Duration::from_secs(parse_value("RETENTION_SECS", &raw)?);
        }
        if let Some(raw) = get("ERROR_CEILING") {
            config.error_ceiling = parse_value("ERROR_CEILING", &raw)?;
        }
        if let Some(raw) = get("RPC_TIMEOUT_SECS") {
            config.rpc_timeout = Duration::from_secs(parse_value("RPC_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = get("LEASE_SECS") {
            config.lease_duration = Duration::from_secs(parse_value("LEASE_SECS", &raw)?);
        }
        if let Some(raw) = get("SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(parse_value("SWEEP_INTERVAL_SECS", &raw)?);
        }
        if let Some(raw) = get("MAX_ATTEMPTS") {
            config.max_retry_attempts = parse_value("MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = get("AUTO_PRUNING") {
            config.enable_auto_pruning = parse_bool_flag(&raw).ok_or_else(|| {
                RelayerError::Configuration(format!("RELAYER_AUTO_PRUNING: invalid flag `{raw}`"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay loops cannot run with.
    pub fn validate(&self) -> Result<(), RelayerError> {
        if self.poll_interval.is_zero() {
            return Err(RelayerError::Configuration("poll interval must be non-zero".into()));
        }
        if self.batch_ceiling == 0 {
            return Err(RelayerError::Configuration("batch ceiling must be at least 1".into()));
        }
        if self.error_ceiling == 0 {
            return Err(RelayerError::Configuration("error ceiling must be at least 1".into()));
        }
        if self.max_retry_attempts == 0 {
            return Err(RelayerError::Configuration("max attempts must be at least 1".into()));
        }
        if self.rpc_timeout.is_zero() {
            return Err(RelayerError::Configuration("rpc timeout must be non-zero".into()));
        }
        if self.lease_duration <= self.rpc_timeout * LEDGER_ROUND_TRIPS {
            return Err(RelayerError::Configuration(format!(
                "lease duration {:?} must exceed {} ledger timeouts of {:?}",
                self.lease_duration, LEDGER_ROUND_TRIPS, self.rpc_timeout
            )));
        }
        if self.enable_auto_pruning && self.sweep_interval.is_zero() {
            return Err(RelayerError::Configuration("sweep interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Checks only needed once the relay talks to a real ledger.
    pub fn validate_ledger(&self) -> Result<(), RelayerError> {
        if self.contract_address.is_empty() {
            return Err(RelayerError::Configuration("RELAYER_CONTRACT_ADDRESS is not set".into()));
        }
        if self.private_keys.is_empty() {
            return Err(RelayerError::Configuration("RELAYER_PRIVATE_KEYS is not set".into()));
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, RelayerError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| RelayerError::Configuration(format!("RELAYER_{key}: invalid value `{raw}`: {e}")))
}

fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
