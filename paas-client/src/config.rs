use crate::request::AuthHeaders;
use paas_core::DEFAULT_API_VERSION;
use std::time::Duration;
use tracing::warn;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the backend, without the API version
    pub server_url: String,
    /// API version path segment, e.g. `1.1`
    pub api_version: String,
    /// Timeout applied to every physical network call
    pub timeout: Duration,
    /// Upper bound on physical calls in flight at once
    pub max_concurrent_requests: usize,
    /// Revalidate cached GETs with `If-None-Match`
    pub last_modify_enabled: bool,
    /// Drain the deferred queue when the dispatcher is built
    pub drain_on_startup: bool,
    /// Drain the deferred queue on `Dispatcher::notify_reconnected`
    pub drain_on_reconnect: bool,
    /// Backoff for replaying deferred requests
    pub retry: RetryConfig,
    pub batch_path: String,
    pub batch_save_path: String,
    pub user_agent: String,
    /// Names of the application id, client key and session token headers
    pub auth_headers: AuthHeaders,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_secs(30),
            max_concurrent_requests: 8,
            last_modify_enabled: false,
            drain_on_startup: false,
            drain_on_reconnect: false,
            retry: RetryConfig::default(),
            batch_path: "/batch".to_string(),
            batch_save_path: "/batch/save".to_string(),
            user_agent: concat!("paas-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            auth_headers: AuthHeaders::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Default configuration overlaid with `PAAS_SERVER_URL`,
    /// `PAAS_API_VERSION` and `PAAS_TIMEOUT_MS` when they are set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("PAAS_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(version) = std::env::var("PAAS_API_VERSION") {
            config.api_version = version;
        }
        if let Ok(raw) = std::env::var("PAAS_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.timeout = Duration::from_millis(ms),
                Err(_) => warn!("Ignoring invalid PAAS_TIMEOUT_MS value {:?}", raw),
            }
        }
        config
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max.max(1);
        self
    }

    pub fn with_last_modify(mut self, enabled: bool) -> Self {
        self.last_modify_enabled = enabled;
        self
    }

    pub fn with_drain_on_startup(mut self, enabled: bool) -> Self {
        self.drain_on_startup = enabled;
        self
    }

    pub fn with_drain_on_reconnect(mut self, enabled: bool) -> Self {
        self.drain_on_reconnect = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_auth_headers(mut self, auth_headers: AuthHeaders) -> Self {
        self.auth_headers = auth_headers;
        self
    }
}

/// Backoff applied between replays of a deferred request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed replays after which a deferred request is dropped. `None`
    /// keeps it queued until it is replayed or rejected.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Replays are attempted again on the very next drain.
    pub fn immediate() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub(crate) fn is_exhausted(&self, retry_count: u32) -> bool {
        self.max_attempts.is_some_and(|max| retry_count >= max)
    }

    /// Delay before the next replay after `retry_count` failures, clamped to
    /// `[0, max_delay]`.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry_count.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // f64::min and f64::max discard NaN in favor of the other operand
        let secs = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new("https://api.example.com")
            .with_api_version("2")
            .with_timeout(Duration::from_secs(5))
            .with_max_concurrent_requests(0)
            .with_drain_on_reconnect(true);

        assert_eq!(config.server_url, "https://api.example.com");
        assert_eq!(config.api_version, "2");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_requests, 1);
        assert!(config.drain_on_reconnect);
        assert!(!config.drain_on_startup);
    }

    #[test]
    fn test_retry_delay_growth() {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_delay_respects_max() {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);
        assert_eq!(retry.delay_for_attempt(6), Duration::from_secs(5));
    }

    #[test]
    fn test_immediate_retry() {
        let retry = RetryConfig::immediate();
        assert_eq!(retry.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(retry.max_attempts, None);
    }

    #[test]
    fn test_attempt_cap_is_opt_in() {
        assert!(!RetryConfig::default().is_exhausted(u32::MAX));
        let capped = RetryConfig::new().with_max_attempts(3);
        assert!(!capped.is_exhausted(2));
        assert!(capped.is_exhausted(3));
    }

    #[test]
    fn test_negative_multiplier_clamps_to_zero() {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(-2.0);
        assert_eq!(retry.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_unrepresentable_delay_falls_back_to_max() {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::MAX)
            .with_backoff_multiplier(f64::MAX);
        assert_eq!(retry.delay_for_attempt(3), Duration::MAX);

        let nan = RetryConfig::new().with_backoff_multiplier(f64::NAN);
        assert_eq!(nan.delay_for_attempt(2), nan.max_delay);
    }
}
