//! Engine configuration
//!
//! Settings resolve from the environment with sane defaults; missing
//! optional credentials degrade the features that need them (email
//! notifications, approval links) rather than failing runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache sizing and expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum number of entries held in memory
    pub capacity: usize,
    /// Default time-to-live for entries
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl_secs: 3600,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Circuit-breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Bound on concurrently dispatched steps within one plan level
    pub max_level_concurrency: usize,
    /// Applied when a step declares no timeout of its own
    pub default_step_timeout_ms: u64,
    pub cache: CacheSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    /// Synthetic token cost recorded for each successful plugin call
    pub plugin_token_equivalent: u64,
    /// Base URL used to build approval links
    pub app_base_url: Option<String>,
    /// API key for the email notification channel
    pub resend_api_key: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_level_concurrency: num_cpus::get() * 2,
            default_step_timeout_ms: 300_000,
            cache: CacheSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            plugin_token_equivalent: 50,
            app_base_url: None,
            resend_api_key: None,
        }
    }
}

impl EngineSettings {
    /// Resolve settings from the environment on top of the defaults
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(value) = std::env::var("FLOWPILOT_MAX_CONCURRENCY") {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed > 0 {
                    settings.max_level_concurrency = parsed;
                }
            }
        }
        if let Ok(value) = std::env::var("FLOWPILOT_CACHE_TTL_SECS") {
            if let Ok(parsed) = value.parse::<u64>() {
                settings.cache.ttl_secs = parsed;
            }
        }
        settings.app_base_url = std::env::var("NEXT_PUBLIC_APP_URL").ok();
        settings.resend_api_key = std::env::var("RESEND_API_KEY").ok();
        settings
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert!(settings.max_level_concurrency >= 2);
        assert_eq!(settings.cache.capacity, 1000);
        assert_eq!(settings.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
    }
}
