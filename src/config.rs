use crate::connection::pool::DEFAULT_MAX_IDLE_TIME;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Recovery journal settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XaCheckConfig {
    /// Directory holding `xacheck.json`
    pub dir: PathBuf,

    /// Time between recovery ticks
    #[serde(with = "duration_ms")]
    pub interval: Duration,

    /// Base delay of the phase-two retry backoff; attempt `n` waits `n * retry_backoff`
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,

    /// Phase-two attempts before handing the xid to the journal
    pub max_retries: u32,
}

impl Default for XaCheckConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./xacheck"),
            interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
            max_retries: 10,
        }
    }
}

/// Execution layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Directory holding `backend.json` and `version.json`
    pub meta_dir: PathBuf,

    /// Run write transactions under XA two-phase commit
    pub twopc_enable: bool,

    /// Per-statement timeout in milliseconds, 0 for none
    pub query_timeout_ms: u64,

    /// Per-statement result size cap in bytes, 0 for none
    pub max_result_size: u64,

    /// Bytes batched before each streaming callback
    pub stream_buffer_size: usize,

    /// Idle time after which pooled connections are replaced
    #[serde(with = "duration_ms")]
    pub pool_max_idle_time: Duration,

    pub xa_check: XaCheckConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            meta_dir: PathBuf::from("./meta"),
            twopc_enable: true,
            query_timeout_ms: 0,
            max_result_size: 0,
            stream_buffer_size: 1024 * 1024,
            pool_max_idle_time: DEFAULT_MAX_IDLE_TIME,
            xa_check: XaCheckConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn new(meta_dir: impl Into<PathBuf>) -> Self {
        let meta_dir = meta_dir.into();
        let xa_check = XaCheckConfig {
            dir: meta_dir.join("xacheck"),
            ..XaCheckConfig::default()
        };
        Self {
            meta_dir,
            xa_check,
            ..Self::default()
        }
    }

    pub fn twopc(mut self, enable: bool) -> Self {
        self.twopc_enable = enable;
        self
    }

    pub fn query_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = timeout_ms;
        self
    }

    pub fn max_result_size(mut self, bytes: u64) -> Self {
        self.max_result_size = bytes;
        self
    }

    pub fn stream_buffer_size(mut self, bytes: usize) -> Self {
        self.stream_buffer_size = bytes;
        self
    }

    pub fn pool_max_idle_time(mut self, idle: Duration) -> Self {
        self.pool_max_idle_time = idle;
        self
    }

    pub fn xa_check_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.xa_check.dir = dir.into();
        self
    }

    pub fn xa_check_interval(mut self, interval: Duration) -> Self {
        self.xa_check.interval = interval;
        self
    }

    pub fn xa_retry_backoff(mut self, backoff: Duration) -> Self {
        self.xa_check.retry_backoff = backoff;
        self
    }

    pub fn xa_max_retries(mut self, retries: u32) -> Self {
        self.xa_check.max_retries = retries;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.stream_buffer_size == 0 {
            return Err("stream_buffer_size must be > 0".to_string());
        }

        if self.xa_check.max_retries == 0 {
            return Err("xa_check.max_retries must be > 0".to_string());
        }

        if self.xa_check.interval.is_zero() {
            return Err("xa_check.interval must be > 0".to_string());
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::new("/tmp/meta");
        assert!(config.twopc_enable);
        assert_eq!(config.xa_check.dir, PathBuf::from("/tmp/meta/xacheck"));
        assert_eq!(config.xa_check.max_retries, 10);
        assert_eq!(config.pool_max_idle_time, Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(ProxyConfig::default().xa_max_retries(0).validate().is_err());
        assert!(ProxyConfig::default().stream_buffer_size(0).validate().is_err());
        assert!(ProxyConfig::default()
            .xa_check_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_json_round_trip_uses_millis() {
        let config = ProxyConfig::default().xa_check_interval(Duration::from_millis(250));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"interval\":250"));

        let partial: ProxyConfig = serde_json::from_str(r#"{"twopc_enable":false}"#).unwrap();
        assert!(!partial.twopc_enable);
        assert_eq!(partial.stream_buffer_size, 1024 * 1024);
    }
}
