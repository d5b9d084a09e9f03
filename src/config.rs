//! TOML configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::{rate::Rate, runtime::handle::RuntimeConfig};

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {}: {source}", path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`WalletConfig`].
    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Wallet settings.
///
/// ```toml
/// token_price = "0.5"
/// reference_currency = "EUR"
/// topup_product_id = 42
/// spend_lock_ttl_secs = 45
/// database_path = "wallet.db"
///
/// [runtime]
/// ack_mode = "durable"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Price of one token in the reference currency.
    #[serde(with = "rust_decimal::serde::str")]
    pub token_price: Decimal,
    /// Currency the price is expressed in.
    pub reference_currency: String,
    /// Host product that represents a top-up purchase.
    pub topup_product_id: Option<u64>,
    /// Lifetime of the per-order spend lock.
    pub spend_lock_ttl_secs: u64,
    /// SQLite journal location; in-memory when absent.
    pub database_path: Option<PathBuf>,
    /// Runtime tuning.
    pub runtime: RuntimeConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            token_price: Decimal::ONE,
            reference_currency: "EUR".to_string(),
            topup_product_id: None,
            spend_lock_ttl_secs: 45,
            database_path: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl WalletConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validated token rate; misconfigured prices fall back to 1.
    pub fn rate(&self) -> Rate {
        Rate::new(self.token_price)
    }

    /// Spend lock lifetime.
    pub fn spend_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.spend_lock_ttl_secs)
    }
}
