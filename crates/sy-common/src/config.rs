//! Router configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Producer cache / service pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Upper bound on cached producers (and pooled keys)
    pub maximum_cache_size: usize,
    /// Idle members per pool key kept for reuse
    pub max_per_key: usize,
    /// Idle time after which an unused entry is evicted
    pub idle_timeout_ms: u64,
    /// How often the eviction sweep runs
    pub purge_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maximum_cache_size: 1000,
            max_per_key: 100,
            idle_timeout_ms: 60_000,
            purge_interval_ms: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

/// Scheduling of a polling consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledPollConfig {
    pub initial_delay_ms: u64,
    pub delay_ms: u64,
    /// Poll again immediately when the previous poll returned messages
    pub greedy: bool,
    /// Polls to skip after hitting a backoff threshold (0 disables backoff)
    pub backoff_multiplier: u32,
    /// Consecutive empty polls before backing off
    pub backoff_idle_threshold: u32,
    /// Consecutive failed polls before backing off
    pub backoff_error_threshold: u32,
    /// Stop after this many polls (0 = forever)
    pub repeat_count: u64,
    /// Upper bound on exchanges per poll (<= 0 = unlimited)
    pub max_messages_per_poll: i64,
    pub send_empty_message_when_idle: bool,
}

impl Default for ScheduledPollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            delay_ms: 500,
            greedy: false,
            backoff_multiplier: 0,
            backoff_idle_threshold: 0,
            backoff_error_threshold: 0,
            repeat_count: 0,
            max_messages_per_poll: 0,
            send_empty_message_when_idle: false,
        }
    }
}

impl ScheduledPollConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn backoff_enabled(&self) -> bool {
        self.backoff_multiplier > 0
            && (self.backoff_idle_threshold > 0 || self.backoff_error_threshold > 0)
    }
}

/// Redelivery behaviour of the default error handler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeliveryPolicy {
    /// -1 retries forever, 0 disables redelivery
    pub maximum_redeliveries: i32,
    pub redelivery_delay_ms: u64,
    pub maximum_redelivery_delay_ms: u64,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1_000,
            maximum_redelivery_delay_ms: 60_000,
            use_exponential_backoff: false,
            backoff_multiplier: 2.0,
        }
    }
}

impl RedeliveryPolicy {
    pub fn with_maximum_redeliveries(mut self, max: i32) -> Self {
        self.maximum_redeliveries = max;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Whether attempt number `redelivery_counter` (1-based) may run.
    pub fn should_redeliver(&self, redelivery_counter: u32) -> bool {
        match self.maximum_redeliveries {
            max if max < 0 => true,
            max => redelivery_counter <= max as u32,
        }
    }

    /// Delay before attempt `redelivery_counter` (1-based).
    pub fn delay_for(&self, redelivery_counter: u32) -> Duration {
        let base = self.redelivery_delay_ms as f64;
        let millis = if self.use_exponential_backoff && redelivery_counter > 1 {
            base * self.backoff_multiplier.powi(redelivery_counter as i32 - 1)
        } else {
            base
        };
        let capped = millis.min(self.maximum_redelivery_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Top level router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    pub name: String,
    pub cache: CacheConfig,
    pub poll: ScheduledPollConfig,
    pub redelivery: RedeliveryPolicy,
    /// Bound on waiting for in-flight exchanges during shutdown
    pub shutdown_timeout_ms: u64,
    pub log_json: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "switchyard".to_string(),
            cache: CacheConfig::default(),
            poll: ScheduledPollConfig::default(),
            redelivery: RedeliveryPolicy::default(),
            shutdown_timeout_ms: 30_000,
            log_json: false,
        }
    }
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RouterConfig {
    /// Defaults overridden by `SWITCHYARD_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            name: std::env::var("SWITCHYARD_NAME").unwrap_or(d.name),
            cache: CacheConfig {
                maximum_cache_size: env_or_parse(
                    "SWITCHYARD_CACHE_MAX_SIZE",
                    d.cache.maximum_cache_size,
                ),
                max_per_key: env_or_parse("SWITCHYARD_CACHE_MAX_PER_KEY", d.cache.max_per_key),
                idle_timeout_ms: env_or_parse(
                    "SWITCHYARD_CACHE_IDLE_TIMEOUT_MS",
                    d.cache.idle_timeout_ms,
                ),
                purge_interval_ms: env_or_parse(
                    "SWITCHYARD_CACHE_PURGE_INTERVAL_MS",
                    d.cache.purge_interval_ms,
                ),
            },
            poll: ScheduledPollConfig {
                initial_delay_ms: env_or_parse(
                    "SWITCHYARD_POLL_INITIAL_DELAY_MS",
                    d.poll.initial_delay_ms,
                ),
                delay_ms: env_or_parse("SWITCHYARD_POLL_DELAY_MS", d.poll.delay_ms),
                greedy: env_or_parse("SWITCHYARD_POLL_GREEDY", d.poll.greedy),
                max_messages_per_poll: env_or_parse(
                    "SWITCHYARD_POLL_MAX_MESSAGES",
                    d.poll.max_messages_per_poll,
                ),
                ..d.poll
            },
            redelivery: RedeliveryPolicy {
                maximum_redeliveries: env_or_parse(
                    "SWITCHYARD_MAX_REDELIVERIES",
                    d.redelivery.maximum_redeliveries,
                ),
                redelivery_delay_ms: env_or_parse(
                    "SWITCHYARD_REDELIVERY_DELAY_MS",
                    d.redelivery.redelivery_delay_ms,
                ),
                ..d.redelivery
            },
            shutdown_timeout_ms: env_or_parse(
                "SWITCHYARD_SHUTDOWN_TIMEOUT_MS",
                d.shutdown_timeout_ms,
            ),
            log_json: env_or_parse("SWITCHYARD_LOG_JSON", d.log_json),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_limits() {
        let policy = RedeliveryPolicy::default().with_maximum_redeliveries(2);
        assert!(policy.should_redeliver(1));
        assert!(policy.should_redeliver(2));
        assert!(!policy.should_redeliver(3));

        assert!(!RedeliveryPolicy::default().should_redeliver(1));
        assert!(RedeliveryPolicy::default()
            .with_maximum_redeliveries(-1)
            .should_redeliver(1_000));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RedeliveryPolicy {
            use_exponential_backoff: true,
            redelivery_delay_ms: 100,
            maximum_redelivery_delay_ms: 500,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_config_deserializes_with_camel_case() {
        let json = r#"{"maximumCacheSize": 5, "maxPerKey": 1, "idleTimeoutMs": 10, "purgeIntervalMs": 5}"#;
        let cache: CacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cache.maximum_cache_size, 5);
        assert_eq!(cache.idle_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_from_env_overrides_defaults() {
        std::env::set_var("SWITCHYARD_NAME", "edge");
        std::env::set_var("SWITCHYARD_CACHE_MAX_SIZE", "7");
        std::env::set_var("SWITCHYARD_POLL_DELAY_MS", "250");
        std::env::set_var("SWITCHYARD_POLL_GREEDY", "true");
        std::env::set_var("SWITCHYARD_LOG_JSON", "true");
        std::env::set_var("SWITCHYARD_SHUTDOWN_TIMEOUT_MS", "not-a-number");

        let config = RouterConfig::from_env();
        for key in [
            "SWITCHYARD_NAME",
            "SWITCHYARD_CACHE_MAX_SIZE",
            "SWITCHYARD_POLL_DELAY_MS",
            "SWITCHYARD_POLL_GREEDY",
            "SWITCHYARD_LOG_JSON",
            "SWITCHYARD_SHUTDOWN_TIMEOUT_MS",
        ] {
            std::env::remove_var(key);
        }

        assert_eq!(config.name, "edge");
        assert_eq!(config.cache.maximum_cache_size, 7);
        assert_eq!(config.poll.delay(), Duration::from_millis(250));
        assert!(config.poll.greedy);
        assert!(config.log_json);
        // unparsable values fall back to the default
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.cache.max_per_key, CacheConfig::default().max_per_key);
    }

    #[test]
    fn test_backoff_enabled() {
        let mut poll = ScheduledPollConfig::default();
        assert!(!poll.backoff_enabled());
        poll.backoff_multiplier = 3;
        poll.backoff_idle_threshold = 2;
        assert!(poll.backoff_enabled());
    }
}
