use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tuning knobs for draining, retry and connectivity debouncing.
///
/// Durations are written as milliseconds in JSON (`request_timeout_ms`, ...).
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    #[serde(rename = "base_backoff_ms", with = "millis")]
    pub base_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    /// Transient failures tolerated before a mutation is dead-lettered.
    pub max_attempts: u32,
    pub stable_checks: u32,
    #[serde(rename = "probe_interval_ms", with = "millis")]
    pub probe_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            request_timeout: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
            max_attempts: 8,
            stable_checks: 2,
            probe_interval: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::LocalStorage(format!("cannot read {}: {}", path.display(), e)))?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Validation("batch_size must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Validation("max_attempts must be at least 1".to_string()));
        }
        if self.stable_checks == 0 {
            return Err(Error::Validation("stable_checks must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_stable_checks(mut self, stable_checks: u32) -> Self {
        self.stable_checks = stable_checks;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// `min(base_backoff * 2^attempts, max_backoff)`
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SyncConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(800));
        assert_eq!(config.backoff_for(4), Duration::from_secs(1));
        assert_eq!(config.backoff_for(64), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"batch_size": 5, "request_timeout_ms": 1500}}"#).unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.max_backoff, Duration::from_secs(300));
    }

    #[test]
    fn test_rejects_zero_batch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"batch_size": 0}}"#).unwrap();
        assert!(matches!(SyncConfig::from_json_file(file.path()), Err(Error::Validation(_))));
    }
}
