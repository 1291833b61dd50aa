//! Tunable constants for the engine.
//!
//! Every time window the engine uses lives here so that none of them are
//! caller-supplied at call sites. All sections default independently, so a
//! TOML file only needs the keys it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ResultExt};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub conflict: ConflictConfig,
    pub gate: GateConfig,
    pub connectivity: ConnectivityConfig,
    pub debounce: DebounceConfig,
    pub retry: RetryConfig,
}

/// Two edits closer together than `threshold_ms` are treated as concurrent.
/// This is a timestamp-proximity heuristic, not real concurrency detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub threshold_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self { threshold_ms: 1_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub min_since_sync_ms: u64,
    pub min_since_local_write_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_since_sync_ms: 15_000,
            min_since_local_write_ms: 20_000,
        }
    }
}

impl GateConfig {
    pub fn min_since_sync(&self) -> Duration {
        Duration::from_millis(self.min_since_sync_ms)
    }

    pub fn min_since_local_write(&self) -> Duration {
        Duration::from_millis(self.min_since_local_write_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// How long a successful probe is trusted. Failed probes get half.
    pub cache_ttl_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub reconnect_poll_ms: u64,
    pub restart_pause_ms: u64,
    pub restart_settle_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            reconnect_timeout_ms: 10_000,
            reconnect_poll_ms: 2_000,
            restart_pause_ms: 1_000,
            restart_settle_ms: 2_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn failed_probe_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms / 2)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn reconnect_poll(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub progress_ms: u64,
    pub structural_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            progress_ms: 1_000,
            structural_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(e.to_string()))
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.conflict.threshold_ms, 1_000);
        assert_eq!(config.gate.min_since_sync(), Duration::from_secs(15));
        assert_eq!(config.gate.min_since_local_write(), Duration::from_secs(20));
        assert_eq!(config.connectivity.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.connectivity.failed_probe_ttl(), Duration::from_secs(15));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            [conflict]
            threshold_ms = 250

            [debounce]
            progress_ms = 400
            "#,
        )
        .unwrap();

        assert_eq!(config.conflict.threshold_ms, 250);
        assert_eq!(config.debounce.progress_ms, 400);
        assert_eq!(config.debounce.structural_ms, 3_000);
        assert_eq!(config.gate, GateConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[retry]\nmax_retries = 5\n").unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = SyncConfig::from_toml_str("[conflict]\nthreshold_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
