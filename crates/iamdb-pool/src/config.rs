//! `iamdb.toml` settings.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::certificate::DEFAULT_STORE_PASSWORD;
use crate::error::{PoolError, PoolResult};
use crate::pool::PoolConfig;
use crate::refresh::DEFAULT_REFRESH_INTERVAL;
use crate::token::TOKEN_LIFETIME;

/// Top-level settings for one authenticating pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Connection URL, e.g. `mysql://cluster.id.eu-west-1.rds.amazonaws.com:3306/appdb`.
    pub url: String,
    /// Database user the tokens are signed for.
    pub username: String,
    /// Dial this address instead of resolving the URL host (SSH tunnels, proxies).
    #[serde(default)]
    pub connect_address: Option<SocketAddr>,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long `close()` waits for the refresh task.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM file with the root CA; the embedded certificate is used when unset.
    pub ca_file: Option<PathBuf>,
    pub trust_store_password: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            ca_file: None,
            trust_store_password: DEFAULT_STORE_PASSWORD.to_string(),
        }
    }
}

/// Selects the signing identity. Empty means the AWS default chain as is.
///
/// Alternative shared files are picked up from `AWS_CONFIG_FILE` and
/// `AWS_SHARED_CREDENTIALS_FILE` by the chain itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// Named profile in the shared config and credentials files.
    pub profile: Option<String>,
}

impl Settings {
    /// Settings with defaults for everything but the endpoint and user.
    pub fn new(url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            connect_address: None,
            refresh: RefreshSettings::default(),
            pool: PoolConfig::default(),
            tls: TlsSettings::default(),
            credentials: CredentialSettings::default(),
        }
    }

    /// Load and validate settings from a TOML file.
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&content).map_err(|e| match e {
            PoolError::Config(msg) => PoolError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.url.trim().is_empty() {
            return Err(PoolError::Config("url must not be empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(PoolError::Config("username must not be empty".into()));
        }
        if self.pool.max_size == 0 {
            return Err(PoolError::Config("pool.max_size must be at least 1".into()));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(PoolError::Config(format!(
                "pool.min_idle ({}) exceeds pool.max_size ({})",
                self.pool.min_idle, self.pool.max_size
            )));
        }
        if self.refresh.interval.is_zero() || self.refresh.interval >= TOKEN_LIFETIME {
            return Err(PoolError::Config(format!(
                "refresh.interval must be positive and shorter than the {TOKEN_LIFETIME:?} token lifetime (got {:?})",
                self.refresh.interval
            )));
        }
        Ok(())
    }
}
