//! # Configuration
//!
//! TOML configuration of the logger daemon.
//!
//! - [`LinkConfig`] - one entry per serial device (`[[links]]`)
//! - [`TimingConfig`] - supervision intervals shared by all links
//! - [`StorageConfig`] - last-value file write policy
//! - [`LoggingConfig`] - log level and optional log file
//!
//! Serial line settings are not configurable; the device always talks 9600 8N1.
//!
//! ```toml
//! [[links]]
//! id = "probe-1"
//! port = "/dev/ttyUSB0"
//! output_dir = "./data/probe-1"
//! auto_rebind = true
//!
//! [timing]
//! idle_threshold_secs = 30
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every field except the link list has a default, so a file holding only `[[links]]`
//! entries is complete.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::engine::EngineSettings;
use crate::link::LinkTimings;
use crate::store::{StorePolicy, DEFAULT_MIN_FREE_BYTES};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub id: String,
    /// Configured port; empty means "whatever is plugged in" (requires auto_rebind).
    #[serde(default)]
    pub port: String,
    pub output_dir: String,
    /// Substitute another present port when `port` is missing.
    #[serde(default = "default_auto_rebind")]
    pub auto_rebind: bool,
}

fn default_auto_rebind() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub idle_threshold_secs: u64,
    pub grace_period_secs: u64,
    pub reconnect_cooldown_secs: u64,
    pub open_backoff_max_secs: u64,
    pub read_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            idle_threshold_secs: 30,
            grace_period_secs: 10,
            reconnect_cooldown_secs: 5,
            open_backoff_max_secs: 60,
            read_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Writes are skipped while the output volume has less free space than this.
    pub min_free_bytes: u64,
    /// Total attempts per write.
    pub write_retries: u32,
    pub write_retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            write_retries: 3,
            write_retry_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.links.is_empty() {
            bail!("No [[links]] configured");
        }
        let mut ids = HashSet::new();
        for link in &self.links {
            if link.id.trim().is_empty() {
                bail!("Link with empty id");
            }
            if !ids.insert(link.id.as_str()) {
                bail!("Duplicate link id '{}'", link.id);
            }
            if link.port.trim().is_empty() && !link.auto_rebind {
                bail!(
                    "Link '{}' has no port and auto_rebind is disabled; it could never connect",
                    link.id
                );
            }
            if link.output_dir.trim().is_empty() {
                bail!("Link '{}' has an empty output_dir", link.id);
            }
        }
        let t = &self.timing;
        for (name, value) in [
            ("poll_interval_ms", t.poll_interval_ms),
            ("idle_threshold_secs", t.idle_threshold_secs),
            ("reconnect_cooldown_secs", t.reconnect_cooldown_secs),
            ("read_timeout_ms", t.read_timeout_ms),
        ] {
            if value == 0 {
                bail!("timing.{} must be greater than zero", name);
            }
        }
        if t.open_backoff_max_secs < t.reconnect_cooldown_secs {
            bail!("timing.open_backoff_max_secs must be >= timing.reconnect_cooldown_secs");
        }
        Ok(())
    }

    pub fn timings(&self) -> LinkTimings {
        let t = &self.timing;
        LinkTimings {
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            idle_threshold: Duration::from_secs(t.idle_threshold_secs),
            grace_period: Duration::from_secs(t.grace_period_secs),
            reconnect_cooldown: Duration::from_secs(t.reconnect_cooldown_secs),
            open_backoff_max: Duration::from_secs(t.open_backoff_max_secs),
            read_timeout: Duration::from_millis(t.read_timeout_ms),
        }
    }

    pub fn store_policy(&self) -> StorePolicy {
        StorePolicy {
            min_free_bytes: self.storage.min_free_bytes,
            attempts: self.storage.write_retries.max(1),
            retry_delay: Duration::from_millis(self.storage.write_retry_delay_ms),
        }
    }

    /// One engine definition per configured link.
    pub fn engine_settings(&self) -> Vec<EngineSettings> {
        self.links
            .iter()
            .map(|link| EngineSettings {
                id: link.id.clone(),
                port: link.port.clone(),
                output_dir: PathBuf::from(&link.output_dir),
                auto_rebind: link.auto_rebind,
                timings: self.timings(),
                store: self.store_policy(),
            })
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        let port = if cfg!(windows) { "COM3" } else { "/dev/ttyUSB0" };
        Config {
            links: vec![LinkConfig {
                id: "probe-1".to_string(),
                port: port.to_string(),
                output_dir: "./data/probe-1".to_string(),
                auto_rebind: true,
            }],
            timing: TimingConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("comlogger.log".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.timings().poll_interval, Duration::from_secs(2));
        assert_eq!(config.store_policy().min_free_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[links]]
            id = "a"
            port = "COM4"
            output_dir = "out"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(config.links[0].auto_rebind);
        assert_eq!(config.timing.idle_threshold_secs, 30);
        assert_eq!(config.storage.write_retries, 3);
        assert_eq!(config.logging.level, "info");

        let settings = config.engine_settings();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].output_dir, PathBuf::from("out"));
        assert_eq!(settings[0].timings.grace_period, Duration::from_secs(10));
    }

    #[test]
    fn partial_timing_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [timing]
            idle_threshold_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.idle_threshold_secs, 90);
        assert_eq!(config.timing.reconnect_cooldown_secs, 5);
    }

    #[test]
    fn logging_section_with_only_a_file() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            file = "comlogger.log"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file.as_deref(), Some("comlogger.log"));
    }

    #[test]
    fn rejects_inconsistent_links() {
        let mut config = Config::default();
        config.links.push(config.links[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.links[0].port.clear();
        config.links[0].auto_rebind = false;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.links.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timing.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comlogger.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.links[0].id, "probe-1");
        assert!(Config::load("/nonexistent/comlogger.toml").await.is_err());
    }
}
