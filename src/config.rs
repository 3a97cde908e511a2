//! Configuration for the server

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::http::HttpConfig;

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9117);

/// Server configuration
///
/// The config is usually loaded from a file with [`Self::load`]. Every field has a default, so
/// a config file only needs to list what differs.
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Human readable name of the map.
    pub name: String,
    /// The address other maps use to reach this map.
    ///
    /// Child maps that report nodes under this name are not cached, those are our own.
    pub hostname: Option<String>,
    /// Public base URL of the web interface, used for links in emails.
    pub public_url: Url,
    /// Addresses allowed to act on any node and to skip email verification.
    pub admin_addresses: Vec<IpAddr>,
    /// Reject registrations and updates.
    pub read_only: bool,
    /// Config for the HTTP server
    ///
    /// If set to `None` no HTTP server will be started.
    pub http: Option<HttpConfig>,
    /// Maps whose nodes are cached and re-exported.
    pub child_maps: Vec<ChildMap>,
    /// Config for caching child maps.
    pub sync: SyncConfig,
    /// Config for email verification of registrations.
    pub verification: VerificationConfig,
    /// Config for outgoing email.
    pub mail: MailConfig,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
}

/// A map whose nodes are cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildMap {
    /// Display name.
    pub name: String,
    /// Address the map is reached at, with or without scheme.
    pub hostname: String,
}

/// Config for caching child maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between two fetches of all child maps.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Timeout of a single fetch.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Cached nodes not seen for this long are dropped. Unset keeps them forever.
    #[serde(with = "humantime_serde")]
    pub max_cache_age: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            timeout: Duration::from_secs(30),
            max_cache_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

/// Config for email verification of registrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Add registrations directly, without email verification.
    pub disabled: bool,
    /// How long a registration waits for its confirmation.
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
    /// Time between two passes expiring tickets and resending failed emails.
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// Only accept confirmations sent from the registered node's address (or an admin).
    pub require_matching_address: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            expiry: Duration::from_secs(24 * 60 * 60),
            maintenance_interval: Duration::from_secs(5 * 60),
            require_matching_address: true,
        }
    }
}

/// Config for outgoing email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Sender address.
    pub from: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: "nodeatlas@localhost".to_string(),
        }
    }
}

/// The config for the metrics server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = if let Some(val) = env::var_os("NODEATLAS_DATA_DIR") {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().ok_or_else(|| {
                anyhow!("operating environment provides no directory for application data")
            })?;
            path.join("nodeatlas")
        };
        Ok(dir)
    }

    /// Get the path to the store database file.
    pub fn store_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("nodeatlas-1.db"))
    }

    /// Addresses of the configured child maps.
    pub fn child_map_addresses(&self) -> Vec<String> {
        self.child_maps.iter().map(|m| m.hostname.clone()).collect()
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "NodeAtlas".to_string(),
            hostname: None,
            public_url: "http://localhost:8080/"
                .parse()
                .expect("default public url is valid"),
            admin_addresses: vec![],
            read_only: false,
            http: Some(HttpConfig {
                port: 8080,
                bind_addr: None,
            }),
            child_maps: vec![],
            sync: SyncConfig::default(),
            verification: VerificationConfig::default(),
            mail: MailConfig::default(),
            metrics: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn parse_partial_config() -> TestResult {
        let config: Config = toml::from_str(
            r#"
            name = "Testmap"
            hostname = "map.example"
            admin_addresses = ["10.0.0.1", "fc00::1"]

            [[child_maps]]
            name = "Other"
            hostname = "other.example"

            [sync]
            interval = "10m"

            [verification]
            expiry = "2h"
            "#,
        )?;
        assert_eq!(config.name, "Testmap");
        assert_eq!(config.admin_addresses.len(), 2);
        assert_eq!(config.child_map_addresses(), vec!["other.example".to_string()]);
        assert_eq!(config.sync.interval, Duration::from_secs(600));
        assert_eq!(config.sync.timeout, SyncConfig::default().timeout);
        assert_eq!(config.verification.expiry, Duration::from_secs(7200));
        assert!(config.verification.require_matching_address);
        assert_eq!(config.http.as_ref().map(|h| h.port), Some(8080));
        Ok(())
    }

    #[test]
    fn metrics_addr() {
        let mut config = Config::default();
        assert_eq!(config.metrics_addr(), Some(DEFAULT_METRICS_ADDR));
        config.metrics = Some(MetricsConfig::disabled());
        assert_eq!(config.metrics_addr(), None);
    }
}
