//! Node Configuration
//!
//! Settings are read from an optional JSON file. Every section and field has a
//! default, so an empty object (or no file at all) yields a working single-node
//! setup. Durations use humantime notation (`"30s"`, `"15m"`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub lock: LockConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub expiration: QueryExpirationProperties,
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// How long `lock()` waits before giving up.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Lease length requested from a remote lock service. Renewed every third of it.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Base delay between acquire attempts on a contended remote lock.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub request_attempts: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(500),
            request_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub num_partitions: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            num_partitions: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Buffered results per listener before senders wait.
    pub capacity: usize,
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,
    /// How long a publisher waits on a full listener before reporting it.
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            receive_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub worker_count: usize,
    /// Idle sleep between scans when no task could be claimed.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// When an open query is considered abandoned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryExpirationProperties {
    /// Max time since the last user interaction.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Max time a `next` call may run without the service touching the query.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
}

impl Default for QueryExpirationProperties {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            call_timeout: Duration::from_secs(60 * 60),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.expiration.idle_timeout, Duration::from_secs(900));
        assert_eq!(config.lock.request_attempts, 3);
    }

    #[test]
    fn test_partial_config_with_humantime_durations() {
        let raw = r#"{
            "lock": { "lock_timeout": "2s", "lease_ttl": "1m" },
            "executor": { "worker_count": 8 },
            "expiration": { "idle_timeout": "5m 30s" }
        }"#;

        let config: NodeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.lock.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.lock.lease_ttl, Duration::from_secs(60));
        assert_eq!(config.lock.poll_interval, Duration::from_millis(50));
        assert_eq!(config.executor.worker_count, 8);
        assert_eq!(config.expiration.idle_timeout, Duration::from_secs(330));
        assert_eq!(config.expiration.call_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_from_file_reports_missing_path() {
        let err = NodeConfig::from_file("/definitely/not/here.json").unwrap_err();

        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
