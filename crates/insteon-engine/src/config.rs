//! Engine configuration.
//!
//! All durations are milliseconds. Every field has a serde default so a
//! partial JSON document is accepted, and `from_env` overlays `INSTEON_*`
//! environment variables on top of the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable names.
pub mod env_vars {
    pub const ACK_TIMEOUT_MS: &str = "INSTEON_ACK_TIMEOUT_MS";
    pub const DIRECT_QUIET_TIME_MS: &str = "INSTEON_DIRECT_QUIET_TIME_MS";
    pub const BROADCAST_QUIET_TIME_MS: &str = "INSTEON_BROADCAST_QUIET_TIME_MS";
    pub const TICK_INTERVAL_MS: &str = "INSTEON_TICK_INTERVAL_MS";
    pub const WRITE_TIMEOUT_MS: &str = "INSTEON_WRITE_TIMEOUT_MS";
    pub const LINK_SPACING_MS: &str = "INSTEON_LINK_SPACING_MS";
    pub const AWAKE_WINDOW_MS: &str = "INSTEON_AWAKE_WINDOW_MS";
    pub const FAILED_QUERY_THRESHOLD: &str = "INSTEON_FAILED_QUERY_THRESHOLD";
    pub const DUPLICATE_WINDOW_MS: &str = "INSTEON_DUPLICATE_WINDOW_MS";
}

/// Runtime tuning of the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Feature ack timeout used when a template gives none
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Quiet time applied to direct messages when they hit the link
    #[serde(default = "default_direct_quiet_time")]
    pub direct_quiet_time_ms: u64,

    /// Quiet time applied to broadcast and group messages
    #[serde(default = "default_broadcast_quiet_time")]
    pub broadcast_quiet_time_ms: u64,

    /// Scheduler tick
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Upper bound on a single link write
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Minimum gap between frames from different devices
    #[serde(default)]
    pub link_spacing_ms: u64,

    /// How long a battery device listens after it last talked
    #[serde(default = "default_awake_window")]
    pub awake_window_ms: u64,

    /// Consecutive query timeouts before a device counts as not responding
    #[serde(default = "default_failed_query_threshold")]
    pub failed_query_threshold: u32,

    /// Window in which repeated group messages are treated as duplicates
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_ms: u64,
}

fn default_ack_timeout() -> u64 {
    6000
}

fn default_direct_quiet_time() -> u64 {
    500
}

fn default_broadcast_quiet_time() -> u64 {
    1500
}

fn default_tick_interval() -> u64 {
    25
}

fn default_write_timeout() -> u64 {
    2000
}

fn default_awake_window() -> u64 {
    3000
}

fn default_failed_query_threshold() -> u32 {
    5
}

fn default_duplicate_window() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            direct_quiet_time_ms: default_direct_quiet_time(),
            broadcast_quiet_time_ms: default_broadcast_quiet_time(),
            tick_interval_ms: default_tick_interval(),
            write_timeout_ms: default_write_timeout(),
            link_spacing_ms: 0,
            awake_window_ms: default_awake_window(),
            failed_query_threshold: default_failed_query_threshold(),
            duplicate_window_ms: default_duplicate_window(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with any `INSTEON_*` variables that parse.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay environment variables onto this config.
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env(env_vars::ACK_TIMEOUT_MS, &mut self.ack_timeout_ms);
        override_from_env(env_vars::DIRECT_QUIET_TIME_MS, &mut self.direct_quiet_time_ms);
        override_from_env(env_vars::BROADCAST_QUIET_TIME_MS, &mut self.broadcast_quiet_time_ms);
        override_from_env(env_vars::TICK_INTERVAL_MS, &mut self.tick_interval_ms);
        override_from_env(env_vars::WRITE_TIMEOUT_MS, &mut self.write_timeout_ms);
        override_from_env(env_vars::LINK_SPACING_MS, &mut self.link_spacing_ms);
        override_from_env(env_vars::AWAKE_WINDOW_MS, &mut self.awake_window_ms);
        override_from_env(env_vars::FAILED_QUERY_THRESHOLD, &mut self.failed_query_threshold);
        override_from_env(env_vars::DUPLICATE_WINDOW_MS, &mut self.duplicate_window_ms);
        self
    }

    pub fn with_link_spacing(mut self, ms: u64) -> Self {
        self.link_spacing_ms = ms;
        self
    }

    pub fn with_tick_interval(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms.max(1);
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn direct_quiet_time(&self) -> Duration {
        Duration::from_millis(self.direct_quiet_time_ms)
    }

    pub fn broadcast_quiet_time(&self) -> Duration {
        Duration::from_millis(self.broadcast_quiet_time_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn link_spacing(&self) -> Duration {
        Duration::from_millis(self.link_spacing_ms)
    }

    pub fn awake_window(&self) -> Duration {
        Duration::from_millis(self.awake_window_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Some(value) = std::env::var(name).ok().and_then(|s| s.trim().parse().ok()) {
        *slot = value;
    }
}

/// Longest ack timeout a template may ask for.
pub const MAX_ACK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Parse a template timeout string: `6000`, `6000ms`, `6s`. Values above
/// [`MAX_ACK_TIMEOUT`] are rejected.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    let millis = if let Some(ms) = value.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok()?
    } else if let Some(secs) = value.strip_suffix('s') {
        secs.trim().parse::<u64>().ok()?.checked_mul(1000)?
    } else {
        value.parse::<u64>().ok()?
    };
    let timeout = Duration::from_millis(millis);
    (timeout <= MAX_ACK_TIMEOUT).then_some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.ack_timeout(), Duration::from_millis(6000));
        assert_eq!(config.direct_quiet_time(), Duration::from_millis(500));
        assert_eq!(config.broadcast_quiet_time(), Duration::from_millis(1500));
        assert_eq!(config.failed_query_threshold, 5);
        assert_eq!(config.link_spacing(), Duration::ZERO);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"ack_timeout_ms": 3000, "link_spacing_ms": 50}"#).unwrap();
        assert_eq!(config.ack_timeout_ms, 3000);
        assert_eq!(config.link_spacing_ms, 50);
        assert_eq!(config.tick_interval_ms, 25);
        assert_eq!(config.awake_window_ms, 3000);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var(env_vars::DUPLICATE_WINDOW_MS, "1234");
        std::env::set_var(env_vars::FAILED_QUERY_THRESHOLD, "not-a-number");
        let config = EngineConfig::from_env();
        std::env::remove_var(env_vars::DUPLICATE_WINDOW_MS);
        std::env::remove_var(env_vars::FAILED_QUERY_THRESHOLD);
        assert_eq!(config.duplicate_window_ms, 1234);
        assert_eq!(config.failed_query_threshold, 5);
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("6000"), Some(Duration::from_millis(6000)));
        assert_eq!(parse_timeout("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_timeout("soon"), None);
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("3600s"), Some(MAX_ACK_TIMEOUT));
        assert_eq!(parse_timeout("3601s"), None);
        assert_eq!(parse_timeout("18446744073709551615s"), None);
        assert_eq!(parse_timeout("18446744073709551615"), None);
    }
}
