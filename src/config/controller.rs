//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::constants::{
    DEFAULT_BACKEND_CONCURRENCY, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_MAX_SECS,
    DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_FIELD_MANAGER, DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
    DEFAULT_MAX_CONCURRENT_RECONCILIATIONS, DEFAULT_METRICS_PORT, DEFAULT_PASS_TIMEOUT_SECS,
    DEFAULT_STORE_TIMEOUT_SECS, DEFAULT_WATCH_RESTART_DELAY_SECS, MIN_REFRESH_INTERVAL_SECS,
};
use crate::controller::reconciler::ReconcileSettings;
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// HTTP port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
    /// Enable color in text format logs
    pub log_enable_color: bool,
    /// Restrict watches to one namespace; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Size of the reconciliation worker pool
    pub max_concurrent_reconciliations: usize,
    /// Minimum accepted refresh interval (seconds)
    pub min_refresh_interval_secs: u64,
    /// Error backoff starting value (seconds)
    pub backoff_base_secs: u64,
    /// Error backoff cap (seconds)
    pub backoff_max_secs: u64,
    /// Timeout per backend call (seconds)
    pub fetch_timeout_secs: u64,
    /// Timeout per store call (seconds)
    pub store_timeout_secs: u64,
    /// Deadline for a whole pass (seconds)
    pub pass_timeout_secs: u64,
    /// Backend health check period (seconds)
    pub health_check_interval_secs: u64,
    /// Per-backend fetch limit when a store does not set `maxConcurrentFetches`
    pub default_backend_concurrency: usize,
    /// Watch stream restart delay after errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Field manager used for every write
    pub field_manager: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
            log_enable_color: false,
            watch_namespace: None,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            min_refresh_interval_secs: MIN_REFRESH_INTERVAL_SECS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            store_timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
            pass_timeout_secs: DEFAULT_PASS_TIMEOUT_SECS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            default_backend_concurrency: DEFAULT_BACKEND_CONCURRENCY,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = Env(&lookup);
        Self {
            metrics_port: env.or_default("METRICS_PORT", defaults.metrics_port),
            log_level: env.or_default_str("LOG_LEVEL", &defaults.log_level),
            log_format: env.or_default_str("LOG_FORMAT", &defaults.log_format),
            log_enable_color: env.or_default_bool("LOG_ENABLE_COLOR", defaults.log_enable_color),
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            max_concurrent_reconciliations: env.or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                defaults.max_concurrent_reconciliations,
            ),
            min_refresh_interval_secs: env
                .or_default("MIN_REFRESH_INTERVAL_SECS", defaults.min_refresh_interval_secs),
            backoff_base_secs: env.or_default("BACKOFF_BASE_SECS", defaults.backoff_base_secs),
            backoff_max_secs: env.or_default("BACKOFF_MAX_SECS", defaults.backoff_max_secs),
            fetch_timeout_secs: env.or_default("FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
            store_timeout_secs: env.or_default("STORE_TIMEOUT_SECS", defaults.store_timeout_secs),
            pass_timeout_secs: env.or_default("PASS_TIMEOUT_SECS", defaults.pass_timeout_secs),
            health_check_interval_secs: env.or_default(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
            default_backend_concurrency: env.or_default(
                "DEFAULT_BACKEND_CONCURRENCY",
                defaults.default_backend_concurrency,
            ),
            watch_restart_delay_secs: env
                .or_default("WATCH_RESTART_DELAY_SECS", defaults.watch_restart_delay_secs),
            field_manager: env.or_default_str("FIELD_MANAGER", &defaults.field_manager),
        }
    }

    /// Get minimum refresh interval duration
    #[must_use]
    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }

    /// Get health check interval duration
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    /// Get watch restart delay duration
    #[must_use]
    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Timeouts and backoff bounds for the reconciler
    #[must_use]
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Read variable or return default value
    fn or_default<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Read variable as boolean or return default
    fn or_default_bool(&self, key: &str, default: bool) -> bool {
        (self.0)(key)
            .map(|v| {
                let v_lower = v.to_lowercase();
                v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
            })
            .unwrap_or(default)
    }

    /// Read variable as string or return default
    fn or_default_str(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }
}
