//! Process-wide configuration, loaded once at startup.
//!
//! Values come from the environment (after loading a `.env` file if one is
//! present). Anything not set falls back to [`LedgerConfig::default`].
//!
//! | Variable                     | Default       |
//! |------------------------------|---------------|
//! | `LEDGER_BASE_CURRENCY`       | `RUB`         |
//! | `LEDGER_RATES_FILE`          | built-in table|
//! | `LEDGER_RATE_CACHE_TTL_SECS` | `300`         |
//! | `LEDGER_LOCK_TIMEOUT_MS`     | `5000`        |
//! | `LEDGER_HISTORY_PAGE_SIZE`   | `50`          |

use crate::currency::Currency;
use crate::error::Result;
use crate::rates::RateTable;
use log::info;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("invalid rate at row {row}: {message}")]
    InvalidRate { row: usize, message: String },
}

/// Immutable settings injected into the store, resolver and engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub base_currency: Currency,

    /// CSV file with `currency,rate` rows. `None` uses the built-in table.
    pub rates_file: Option<PathBuf>,

    pub rate_cache_ttl: Duration,

    /// How long a unit waits for a row lock before giving up.
    pub lock_timeout: Duration,

    pub history_page_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            base_currency: Currency::known("RUB"),
            rates_file: None,
            rate_cache_ttl: Duration::from_secs(300),
            lock_timeout: Duration::from_millis(5000),
            history_page_size: 50,
        }
    }
}

impl LedgerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be
    /// parsed.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = LedgerConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_currency = match get("LEDGER_BASE_CURRENCY") {
            Some(raw) => Currency::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                key: "LEDGER_BASE_CURRENCY".to_string(),
                message: e.to_string(),
            })?,
            None => defaults.base_currency,
        };

        let rates_file = get("LEDGER_RATES_FILE").map(|raw| PathBuf::from(raw.trim()));

        let rate_cache_ttl = parse_optional(&get, "LEDGER_RATE_CACHE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.rate_cache_ttl);

        let lock_timeout = parse_optional(&get, "LEDGER_LOCK_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);

        let history_page_size = match parse_optional::<usize>(&get, "LEDGER_HISTORY_PAGE_SIZE")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "LEDGER_HISTORY_PAGE_SIZE".to_string(),
                    message: "must be at least 1".to_string(),
                })
            }
            Some(size) => size,
            None => defaults.history_page_size,
        };

        Ok(LedgerConfig {
            base_currency,
            rates_file,
            rate_cache_ttl,
            lock_timeout,
            history_page_size,
        })
    }

    /// Builds the rate table: the configured file if any, else the built-in
    /// table for the base currency.
    pub fn rate_table(&self) -> Result<RateTable> {
        match &self.rates_file {
            Some(path) => {
                info!("Loading exchange rates from {}", path.display());
                let file = File::open(path)?;
                RateTable::from_csv(self.base_currency.clone(), BufReader::new(file))
            }
            None => Ok(RateTable::standard_for(self.base_currency.clone())),
        }
    }
}

fn parse_optional<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> std::result::Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{:?}: {}", raw, e),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = LedgerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.base_currency.as_str(), "RUB");
        assert_eq!(config.rate_cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("LEDGER_BASE_CURRENCY", "eur"),
            ("LEDGER_RATE_CACHE_TTL_SECS", "60"),
            ("LEDGER_LOCK_TIMEOUT_MS", "250"),
            ("LEDGER_HISTORY_PAGE_SIZE", "10"),
            ("LEDGER_RATES_FILE", "/tmp/rates.csv"),
        ]))
        .unwrap();

        assert_eq!(config.base_currency.as_str(), "EUR");
        assert_eq!(config.rate_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.history_page_size, 10);
        assert_eq!(config.rates_file, Some(PathBuf::from("/tmp/rates.csv")));
    }

    #[test]
    fn test_invalid_values() {
        let err = LedgerConfig::from_lookup(lookup(&[("LEDGER_LOCK_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key, .. } if key == "LEDGER_LOCK_TIMEOUT_MS"
        ));

        assert!(LedgerConfig::from_lookup(lookup(&[("LEDGER_HISTORY_PAGE_SIZE", "0")])).is_err());
        assert!(LedgerConfig::from_lookup(lookup(&[("LEDGER_BASE_CURRENCY", "RU")])).is_err());
    }

    #[test]
    fn test_rate_table_defaults() {
        let table = LedgerConfig::default().rate_table().unwrap();
        assert_eq!(table.base().as_str(), "RUB");
        assert_eq!(table.len(), 2);

        let config = LedgerConfig {
            base_currency: "USD".parse().unwrap(),
            ..LedgerConfig::default()
        };
        assert!(config.rate_table().unwrap().is_empty());
    }
}
