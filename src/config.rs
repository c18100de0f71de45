//! Client configuration
//!
//! Built once at startup, validated, then shared read-only. Defaults come
//! from the `constants` module; `from_env` layers deployment settings on
//! top of them.

use crate::{constants::*, error::ConfigError};
use reqwest::header::{HeaderName, HeaderValue};
use std::fmt;
use std::time::Duration;

/// Environment variable holding the API key
pub const ENV_API_KEY: &str = "MARKET_DATA_API_KEY";
/// Environment variable naming the API key header (switches to query placement when set to `query:<param>`)
pub const ENV_API_KEY_HEADER: &str = "MARKET_DATA_API_KEY_HEADER";
/// Environment variable overriding the API base URL
pub const ENV_BASE_URL: &str = "MARKET_DATA_BASE_URL";
/// Environment variable overriding the poll interval in seconds
pub const ENV_POLL_INTERVAL_SECS: &str = "MARKET_DATA_POLL_INTERVAL_SECS";

/// Where the API key travels on each request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyPlacement {
    /// As a request header with the given name
    Header(String),
    /// As a query parameter with the given name
    Query(String),
}

/// API key, redacted in debug output
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    value: String,
    placement: ApiKeyPlacement,
}

impl ApiKey {
    /// Key sent in the default CoinGecko header
    pub fn header(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            placement: ApiKeyPlacement::Header(DEFAULT_API_KEY_HEADER.to_string()),
        }
    }

    /// Key sent with an explicit placement
    pub fn with_placement(value: impl Into<String>, placement: ApiKeyPlacement) -> Self {
        Self {
            value: value.into(),
            placement,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn placement(&self) -> &ApiKeyPlacement {
        &self.placement
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("value", &"***")
            .field("placement", &self.placement)
            .finish()
    }
}

/// Outbound HTTP settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL every endpoint is appended to
    pub base_url: String,
    /// Headers sent with every request
    pub headers: Vec<(String, String)>,
    /// Optional API key
    pub api_key: Option<ApiKey>,
    /// Upper bound on a single attempt
    pub timeout: Duration,
    /// Total attempts per logical request
    pub retry_attempts: u32,
    /// Base delay between attempts, scaled by the attempt number
    pub retry_delay: Duration,
    /// Logical requests in flight at once, further ones queue
    pub max_concurrent_requests: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            headers: vec![("accept".to_string(), "application/json".to_string())],
            api_key: None,
            timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            retry_attempts: RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
        }
    }
}

/// Cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry stays fresh
    pub duration: Duration,
    /// Serve stale entries while refreshing them in the background
    pub stale_while_revalidate: bool,
    /// Namespace for persisted entries
    pub storage_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(CACHE_DURATION_MS),
            stale_while_revalidate: true,
            storage_prefix: STORAGE_KEY_PREFIX.to_string(),
        }
    }
}

/// Sliding window rate limit settings
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub time_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: RATE_LIMIT_MAX_REQUESTS,
            time_window: Duration::from_millis(RATE_LIMIT_WINDOW_MS),
        }
    }
}

/// Background polling settings
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(POLL_INTERVAL_SECS),
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub polling: PollingConfig,
}

impl ClientConfig {
    /// Defaults overridden by `MARKET_DATA_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(base_url) = lookup(ENV_BASE_URL) {
            config.api.base_url = base_url.trim_end_matches('/').to_string();
        }

        if let Some(value) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            let placement = match lookup(ENV_API_KEY_HEADER) {
                Some(raw) => match raw.strip_prefix("query:") {
                    Some(param) => ApiKeyPlacement::Query(param.to_string()),
                    None => ApiKeyPlacement::Header(raw),
                },
                None => ApiKeyPlacement::Header(DEFAULT_API_KEY_HEADER.to_string()),
            };
            config.api.api_key = Some(ApiKey::with_placement(value, placement));
        }

        if let Some(raw) = lookup(ENV_POLL_INTERVAL_SECS) {
            let secs: u64 = raw.parse().map_err(|e| ConfigError::Env {
                var: ENV_POLL_INTERVAL_SECS,
                reason: format!("{}: {:?}", e, raw),
            })?;
            config.polling.interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the client cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = &self.api.base_url;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "api.base_url",
                format!("expected an http(s) URL, got {:?}", base_url),
            ));
        }
        if let Err(e) = reqwest::Url::parse(base_url) {
            return Err(ConfigError::invalid(
                "api.base_url",
                format!("{:?}: {}", base_url, e),
            ));
        }
        if self.api.timeout.is_zero() {
            return Err(ConfigError::invalid("api.timeout", "must be non-zero"));
        }
        if self.api.retry_attempts == 0 {
            return Err(ConfigError::invalid(
                "api.retry_attempts",
                "at least one attempt is required",
            ));
        }
        if self.api.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid(
                "api.max_concurrent_requests",
                "at least one concurrent request is required",
            ));
        }
        for (name, value) in &self.api.headers {
            validate_header("api.headers", name, value)?;
        }
        if let Some(key) = &self.api.api_key {
            match key.placement() {
                ApiKeyPlacement::Header(name) => validate_header("api.api_key", name, key.value())?,
                ApiKeyPlacement::Query(param) if param.is_empty() => {
                    return Err(ConfigError::invalid("api.api_key", "empty query parameter"));
                }
                ApiKeyPlacement::Query(_) => {}
            }
        }
        if self.cache.duration.is_zero() {
            return Err(ConfigError::invalid("cache.duration", "must be non-zero"));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.max_requests",
                "must be non-zero",
            ));
        }
        if self.rate_limit.time_window.is_zero() {
            return Err(ConfigError::invalid(
                "rate_limit.time_window",
                "must be non-zero",
            ));
        }
        if self.polling.interval.is_zero() {
            return Err(ConfigError::invalid("polling.interval", "must be non-zero"));
        }
        Ok(())
    }
}

fn validate_header(field: &'static str, name: &str, value: &str) -> Result<(), ConfigError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ConfigError::invalid(field, format!("header name {:?}: {}", name, e)))?;
    HeaderValue::from_str(value)
        .map_err(|e| ConfigError::invalid(field, format!("header {:?} value: {}", name, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api.retry_attempts, 3);
        assert_eq!(config.api.max_concurrent_requests, 5);
        assert_eq!(config.cache.duration, Duration::from_secs(60));
        assert!(config.cache.stale_while_revalidate);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert!(config.api.api_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            (ENV_API_KEY, "secret"),
            (ENV_BASE_URL, "http://localhost:8080/api/"),
            (ENV_POLL_INTERVAL_SECS, "15"),
        ]))
        .unwrap();

        assert_eq!(config.api.base_url, "http://localhost:8080/api");
        assert_eq!(config.polling.interval, Duration::from_secs(15));
        let key = config.api.api_key.unwrap();
        assert_eq!(key.value(), "secret");
        assert_eq!(
            key.placement(),
            &ApiKeyPlacement::Header(DEFAULT_API_KEY_HEADER.to_string())
        );
    }

    #[test]
    fn test_env_query_placement() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            (ENV_API_KEY, "secret"),
            (ENV_API_KEY_HEADER, "query:x_cg_demo_api_key"),
        ]))
        .unwrap();

        assert_eq!(
            config.api.api_key.unwrap().placement(),
            &ApiKeyPlacement::Query("x_cg_demo_api_key".to_string())
        );
    }

    #[test]
    fn test_bad_poll_interval_rejected() {
        let err = ClientConfig::from_lookup(lookup_from(&[(ENV_POLL_INTERVAL_SECS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = ClientConfig::default();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.api.retry_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.api.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.api.base_url = "http://exa mple.com".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.api.max_concurrent_requests = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "api.max_concurrent_requests",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_header() {
        let mut config = ClientConfig::default();
        config.api.api_key = Some(ApiKey::with_placement(
            "secret",
            ApiKeyPlacement::Header("bad header".to_string()),
        ));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "api.api_key",
                ..
            })
        ));
    }

    #[test]
    fn test_api_key_debug_is_redacted() {
        let key = ApiKey::header("super-secret");
        let debug = format!("{:?}", key);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("***"));
    }
}
