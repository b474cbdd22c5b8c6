//! Service configuration.
//!
//! [`ServiceConfig::from_env`] reads the deployment's environment; tests
//! build the struct directly or go through [`ServiceConfig::from_lookup`].

use std::str::FromStr;
use std::time::Duration;

use qkm_crypto::MasterKey;
use thiserror::Error;

/// Environment variable holding the master secret.
pub const MASTER_KEY_VAR: &str = "QKM_MASTER_KEY";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// A required variable is unset.
    #[error("{0} is not set")]
    Missing(&'static str),

    /// Values parse individually but contradict each other.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Configuration for [`KeyDeliveryService`](crate::KeyDeliveryService).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Key size when a request does not name one.
    pub default_key_size_bits: usize,

    /// TTL when a request does not name one.
    pub default_ttl: Duration,

    /// Per-bit flip probability on the simulated channel.
    pub error_rate: f64,

    pub min_key_size_bits: usize,
    pub max_key_size_bits: usize,

    /// Hand out unexpired spare pairings before minting new ones.
    pub pool_reuse: bool,

    /// Extra pairings minted on a pool miss. Ignored without `pool_reuse`.
    pub prefetch: usize,

    /// Upper bound on any single service operation.
    pub io_timeout: Duration,

    /// Retries for read-only storage calls.
    pub read_retries: u32,

    /// Period of the background purge task.
    pub purge_interval: Duration,

    /// Fixed simulator seed. `None` draws from OS entropy.
    pub simulator_seed: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_key_size_bits: 256,
            default_ttl: Duration::from_secs(3600),
            error_rate: 0.0,
            min_key_size_bits: 8,
            max_key_size_bits: 8192,
            pool_reuse: false,
            prefetch: 0,
            io_timeout: Duration::from_millis(5000),
            read_retries: 3,
            purge_interval: Duration::from_secs(300),
            simulator_seed: None,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            default_key_size_bits: parse_or(&lookup, "QKD_KEY_SIZE", defaults.default_key_size_bits)?,
            default_ttl: Duration::from_secs(parse_or(
                &lookup,
                "QKD_KEY_TTL",
                defaults.default_ttl.as_secs(),
            )?),
            error_rate: parse_or(&lookup, "QKD_ERROR_RATE", defaults.error_rate)?,
            min_key_size_bits: parse_or(&lookup, "QKM_MIN_KEY_SIZE", defaults.min_key_size_bits)?,
            max_key_size_bits: parse_or(&lookup, "QKM_MAX_KEY_SIZE", defaults.max_key_size_bits)?,
            pool_reuse: parse_flag(&lookup, "QKM_POOL_REUSE", defaults.pool_reuse)?,
            prefetch: parse_or(&lookup, "QKM_PREFETCH", defaults.prefetch)?,
            io_timeout: Duration::from_millis(parse_or(
                &lookup,
                "QKM_IO_TIMEOUT_MS",
                defaults.io_timeout.as_millis() as u64,
            )?),
            read_retries: parse_or(&lookup, "QKM_READ_RETRIES", defaults.read_retries)?,
            purge_interval: Duration::from_secs(parse_or(
                &lookup,
                "QKM_PURGE_INTERVAL",
                defaults.purge_interval.as_secs(),
            )?),
            simulator_seed: match lookup("QKM_SIM_SEED") {
                Some(raw) => Some(parse_value("QKM_SIM_SEED", &raw)?),
                None => None,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_key_size_bits == 0 {
            return Err(ConfigError::Inconsistent("minimum key size must be positive".into()));
        }
        if self.min_key_size_bits > self.max_key_size_bits {
            return Err(ConfigError::Inconsistent(format!(
                "minimum key size {} exceeds maximum {}",
                self.min_key_size_bits, self.max_key_size_bits
            )));
        }
        if !(self.min_key_size_bits..=self.max_key_size_bits).contains(&self.default_key_size_bits) {
            return Err(ConfigError::Inconsistent(format!(
                "default key size {} outside {}..={}",
                self.default_key_size_bits, self.min_key_size_bits, self.max_key_size_bits
            )));
        }
        if !(0.0..0.5).contains(&self.error_rate) {
            return Err(ConfigError::Inconsistent(format!(
                "error rate {} outside [0, 0.5)",
                self.error_rate
            )));
        }
        if self.default_ttl.is_zero() || self.io_timeout.is_zero() || self.purge_interval.is_zero() {
            return Err(ConfigError::Inconsistent("durations must be non-zero".into()));
        }
        Ok(())
    }

    /// Whether `bits` is inside the configured key size bounds.
    pub fn size_allowed(&self, bits: usize) -> bool {
        (self.min_key_size_bits..=self.max_key_size_bits).contains(&bits)
    }
}

/// Load the master key from `QKM_MASTER_KEY`.
pub fn master_key_from_env() -> Result<MasterKey, ConfigError> {
    master_key_from_lookup(|var| std::env::var(var).ok())
}

/// Load the master key from a lookup.
///
/// A 64-character hex value is taken as raw key bytes; anything else is a
/// passphrase.
pub fn master_key_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<MasterKey, ConfigError> {
    let raw = lookup(MASTER_KEY_VAR).ok_or(ConfigError::Missing(MASTER_KEY_VAR))?;
    let trimmed = raw.trim();

    let looks_hex = trimmed.len() == 64 && trimmed.bytes().all(|b| b.is_ascii_hexdigit());
    let key = if looks_hex {
        MasterKey::from_hex(trimmed)
    } else {
        MasterKey::from_passphrase(trimmed)
    };

    key.map_err(|e| ConfigError::Invalid {
        var: MASTER_KEY_VAR,
        value: "<redacted>".into(),
        reason: e.to_string(),
    })
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "expected a boolean".into(),
        }),
    }
}
