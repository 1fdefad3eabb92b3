use anyhow::{ensure, Context};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{env, fs, path::Path};
use tracing::warn;

/// Environment variable naming the TOML file read into [`CONFIG`].
pub const CONFIG_ENV: &str = "BLIPQ_CONFIG";

/// Initial threshold limits for newly declared queues. Sizes are in bytes.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QueueDefaults {
    pub max_message_size: u64,
    pub max_message_count: u64,
    pub max_queue_depth: u64,
    /// Buffered threshold events per queue before slow listeners lag.
    pub notification_capacity: usize,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            max_message_count: 10_000,
            max_queue_depth: 10 * 1024 * 1024 * 1024,
            notification_capacity: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Worker threads in the shared pool; 0 dispatches inline.
    pub workers: usize,
    /// Jobs that may wait for a worker before submission falls back inline.
    pub task_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_capacity: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub queues: QueueDefaults,
    pub delivery: DeliveryConfig,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.queues.notification_capacity > 0,
            "queues.notification_capacity must be greater than zero"
        );
        ensure!(
            self.delivery.workers == 0 || self.delivery.task_capacity > 0,
            "delivery.task_capacity must be greater than zero when workers are configured"
        );
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let path = path.as_ref();
    let raw: String = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Process-wide configuration, loaded once from `$BLIPQ_CONFIG`.
pub static CONFIG: Lazy<Config> = Lazy::new(|| match env::var(CONFIG_ENV) {
    Ok(path) => load_config(&path).unwrap_or_else(|e| {
        warn!(target: "blipq::config", path = %path, error = %e, "invalid config; using defaults");
        Config::default()
    }),
    Err(_) => Config::default(),
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.queues.max_message_count, 10_000);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str("[delivery]\nworkers = 0\n").unwrap();
        assert_eq!(cfg.delivery.workers, 0);
        assert_eq!(cfg.delivery.task_capacity, 1024);
        assert_eq!(cfg.queues, QueueDefaults::default());
    }

    #[test]
    fn zero_notification_capacity_is_invalid() {
        let mut cfg = Config::default();
        cfg.queues.notification_capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
