//! Market data service
//!
//! The only surface the dashboard talks to. Composes the cache, the rate
//! limiter and the retrying fetcher into named accessors, and owns the
//! optional top coins poller.

use crate::{
    cache::{CacheStatus, CacheStore},
    config::ClientConfig,
    constants::{TOP_COINS_CACHE_KEY, TOP_COINS_PER_PAGE, VS_CURRENCY},
    error::{ApiError, ConfigError},
    fetcher::RetryingFetcher,
    rate_limiter::{RateLimitStatus, RateLimiter},
    storage::KeyValueStorage,
    transport::{HttpTransport, ReqwestTransport},
    types::{CacheEvent, CoinMarket, MarketChart},
    validation::{validate_chart_days, validate_coin_id},
};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub rate_limit: RateLimitStatus,
    pub cache: CacheStatus,
    /// Whether the background poller is running
    pub polling: bool,
}

/// Cached, rate-limited access to the market data API
///
/// Construction has no side effects; polling only starts with `start()` and
/// stops with `stop()` or when the service is dropped.
///
/// # Example
/// ```no_run
/// use market_data_client::{ClientConfig, MarketDataService};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = MarketDataService::new(ClientConfig::from_env()?)?;
/// service.start();
///
/// let coins = service.top_coins().await?;
/// for coin in coins.iter().take(5) {
///     println!("{}: ${:.2}", coin.symbol, coin.current_price.unwrap_or_default());
/// }
///
/// service.stop();
/// # Ok(())
/// # }
/// ```
pub struct MarketDataService {
    config: Arc<ClientConfig>,
    cache: CacheStore,
    limiter: Arc<RateLimiter>,
    fetcher: Arc<RetryingFetcher>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataService {
    /// Creates a service with an in-memory cache
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        Self::with_transport(config, Self::default_transport()?, None)
    }

    /// Creates a service whose cache is mirrored to `storage`
    pub fn with_storage(
        config: ClientConfig,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Self, ConfigError> {
        Self::with_transport(config, Self::default_transport()?, Some(storage))
    }

    /// Creates a service on top of a custom transport
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        storage: Option<Arc<dyn KeyValueStorage>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = match storage {
            Some(storage) => CacheStore::with_storage(config.cache.clone(), storage),
            None => CacheStore::new(config.cache.clone()),
        };
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let fetcher = Arc::new(RetryingFetcher::new(transport, config.api.clone()));

        Ok(Self {
            config: Arc::new(config),
            cache,
            limiter,
            fetcher,
            poller: Mutex::new(None),
        })
    }

    fn default_transport() -> Result<Arc<dyn HttpTransport>, ConfigError> {
        let transport =
            ReqwestTransport::new().map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Arc::new(transport))
    }

    /// Markets listing, ordered by market cap
    ///
    /// # Returns
    /// The raw listing, from cache when possible, or the last cached listing
    /// if a refresh fails
    pub async fn fetch_top_coins(&self) -> Result<Value, ApiError> {
        self.request(TOP_COINS_CACHE_KEY, top_coins_endpoint()).await
    }

    /// Full details for one coin
    ///
    /// # Arguments
    /// * `coin_id` - API id of the coin, e.g. `bitcoin` or `usd-coin`
    ///
    /// # Returns
    /// The raw details payload, or a `Validation` error before any request
    /// if `coin_id` is malformed
    pub async fn fetch_coin_details(&self, coin_id: &str) -> Result<Value, ApiError> {
        validate_coin_id(coin_id)?;
        let endpoint = format!(
            "/coins/{}?localization=false&tickers=false&market_data=true&community_data=false&developer_data=false",
            coin_id
        );
        self.request(&format!("coin_{}", coin_id), endpoint).await
    }

    /// Price, market cap and volume history for one coin over `days` days
    ///
    /// # Arguments
    /// * `coin_id` - API id of the coin
    /// * `days` - History window in days, at least 1
    ///
    /// # Returns
    /// The raw chart payload with `prices`, `market_caps` and `total_volumes`
    pub async fn fetch_coin_market_chart(
        &self,
        coin_id: &str,
        days: u32,
    ) -> Result<Value, ApiError> {
        validate_coin_id(coin_id)?;
        validate_chart_days(days)?;
        let endpoint = format!(
            "/coins/{}/market_chart?vs_currency={}&days={}",
            coin_id, VS_CURRENCY, days
        );
        self.request(&format!("chart_{}_{}", coin_id, days), endpoint)
            .await
    }

    /// Markets listing as typed rows
    pub async fn top_coins(&self) -> Result<Vec<CoinMarket>, ApiError> {
        let value = self.fetch_top_coins().await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::invalid_response(format!("Unexpected markets payload: {}", e)))
    }

    /// Chart history as a typed series
    pub async fn market_chart(&self, coin_id: &str, days: u32) -> Result<MarketChart, ApiError> {
        let value = self.fetch_coin_market_chart(coin_id, days).await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::invalid_response(format!("Unexpected chart payload: {}", e)))
    }

    /// Forces a refresh of the markets listing
    ///
    /// Bypasses freshness but not the rate limiter.
    pub async fn refresh_top_coins(&self) -> Result<Value, ApiError> {
        Self::revalidate_top_coins(&self.cache, &self.limiter, &self.fetcher).await
    }

    /// Serves `key` from cache, falling back to any cached value on failure
    async fn request(&self, key: &str, endpoint: String) -> Result<Value, ApiError> {
        let fetch_fn = gated_fetch(self.limiter.clone(), self.fetcher.clone(), endpoint);

        match self.cache.get(key, fetch_fn).await {
            Ok(value) => Ok(value),
            Err(e) => match self.cache.peek(key).await {
                Some(entry) => {
                    tracing::warn!(
                        key,
                        age_ms = entry.age().as_millis() as u64,
                        error = %e,
                        "Serving cached data after failed request"
                    );
                    Ok(entry.data)
                }
                None => Err(e),
            },
        }
    }

    async fn revalidate_top_coins(
        cache: &CacheStore,
        limiter: &Arc<RateLimiter>,
        fetcher: &Arc<RetryingFetcher>,
    ) -> Result<Value, ApiError> {
        let fetch_fn = gated_fetch(limiter.clone(), fetcher.clone(), top_coins_endpoint());
        cache.revalidate(TOP_COINS_CACHE_KEY, fetch_fn).await
    }

    fn poller(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts polling the markets listing in the background
    ///
    /// Does nothing if the poller is already running.
    pub fn start(&self) {
        let mut poller = self.poller();
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Top coins poller already running");
            return;
        }

        let cache = self.cache.clone();
        let limiter = self.limiter.clone();
        let fetcher = self.fetcher.clone();
        let interval = self.config.polling.interval;

        *poller = Some(tokio::spawn(async move {
            tracing::info!(
                poll_interval_secs = interval.as_secs(),
                "Starting top coins poller"
            );

            loop {
                match Self::revalidate_top_coins(&cache, &limiter, &fetcher).await {
                    Ok(_) => tracing::debug!("Refreshed top coins"),
                    Err(e) => tracing::warn!(error = %e, "Failed to refresh top coins"),
                }

                sleep(interval).await;
            }
        }));
    }

    /// Stops the background poller
    pub fn stop(&self) {
        if let Some(handle) = self.poller().take() {
            handle.abort();
            tracing::info!("Stopped top coins poller");
        }
    }

    /// Whether the background poller is running
    pub fn is_polling(&self) -> bool {
        self.poller()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Subscribes to cache updates and fetch failures
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.cache.subscribe()
    }

    /// Read-only snapshot of cache and rate limiter state
    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            rate_limit: self.limiter.status(),
            cache: self.cache.status().await,
            polling: self.is_polling(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for MarketDataService {
    fn drop(&mut self) {
        if let Some(handle) = self.poller().take() {
            handle.abort();
        }
    }
}

fn top_coins_endpoint() -> String {
    format!(
        "/coins/markets?vs_currency={}&order=market_cap_desc&per_page={}&page=1&sparkline=false",
        VS_CURRENCY, TOP_COINS_PER_PAGE
    )
}

/// Fetch function for the cache: take a rate limit slot, then fetch
fn gated_fetch(
    limiter: Arc<RateLimiter>,
    fetcher: Arc<RetryingFetcher>,
    endpoint: String,
) -> impl FnOnce() -> BoxFuture<'static, Result<Value, ApiError>> + Send + 'static {
    move || {
        async move {
            if !limiter.try_acquire() {
                let wait = limiter.wait_time();
                tracing::warn!(
                    endpoint = %endpoint,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit reached, request not sent"
                );
                return Err(ApiError::RateLimitExceeded { wait });
            }
            fetcher.fetch_with_retry(&endpoint).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockReply, MockTransport};
    use crate::types::{now_millis, CacheEntry};
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.api.base_url = "https://api.test/v3".to_string();
        config.api.retry_attempts = 2;
        config.api.retry_delay = Duration::from_millis(10);
        config.polling.interval = Duration::from_secs(30);
        config
    }

    fn service(config: ClientConfig, mock: &Arc<MockTransport>) -> MarketDataService {
        MarketDataService::with_transport(config, mock.clone(), None).unwrap()
    }

    fn coins_payload() -> Value {
        json!([
            {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 50000.0},
            {"id": "ethereum", "symbol": "eth", "name": "Ethereum", "current_price": 3000.0}
        ])
    }

    #[tokio::test]
    async fn test_top_coins_fetched_once_then_cached() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::json(coins_payload()));
        let service = service(test_config(), &mock);

        let first = service.fetch_top_coins().await.unwrap();
        let second = service.fetch_top_coins().await.unwrap();

        assert_eq!(first, coins_payload());
        assert_eq!(second, coins_payload());
        assert_eq!(mock.call_count(), 1);
        assert_eq!(
            mock.requests()[0].url,
            "https://api.test/v3/coins/markets?vs_currency=usd&order=market_cap_desc&per_page=100&page=1&sparkline=false"
        );
    }

    #[tokio::test]
    async fn test_invalid_coin_ids_fail_without_network() {
        let mock = Arc::new(MockTransport::new());
        let service = service(test_config(), &mock);
        let too_long = "a".repeat(51);

        for coin_id in ["bitcoin; DROP", "", "../etc", too_long.as_str()] {
            let err = service.fetch_coin_details(coin_id).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "{:?}", coin_id);
        }
        let err = service
            .fetch_coin_market_chart("bitcoin", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        assert_eq!(mock.call_count(), 0);
        assert_eq!(service.status().await.rate_limit.current_requests, 0);
    }

    #[tokio::test]
    async fn test_detail_and_chart_keys_and_endpoints() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::json(json!({"prices": [[1.0, 2.0]]})));
        let service = service(test_config(), &mock);

        service.fetch_coin_details("usd-coin").await.unwrap();
        service.fetch_coin_market_chart("bitcoin", 7).await.unwrap();

        let status = service.status().await;
        assert_eq!(status.cache.keys, vec!["chart_bitcoin_7", "coin_usd-coin"]);
        assert_eq!(status.rate_limit.current_requests, 2);

        let urls: Vec<String> = mock.requests().into_iter().map(|r| r.url).collect();
        assert!(urls[0].starts_with("https://api.test/v3/coins/usd-coin?localization=false"));
        assert_eq!(
            urls[1],
            "https://api.test/v3/coins/bitcoin/market_chart?vs_currency=usd&days=7"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_without_cache_fails_with_wait_time() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::json(json!({})));
        let mut config = test_config();
        config.rate_limit.max_requests = 1;
        let service = service(config, &mock);

        service.fetch_coin_details("bitcoin").await.unwrap();
        let err = service.fetch_coin_details("ethereum").await.unwrap_err();

        match err {
            ApiError::RateLimitExceeded { wait } => {
                assert!(wait > Duration::ZERO);
                assert!(wait <= Duration::from_secs(60));
            }
            other => panic!("expected RateLimitExceeded, got {:?}", other),
        }
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_with_stale_cache_serves_stale_value() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::json(json!({})));
        let mut config = test_config();
        config.rate_limit.max_requests = 1;
        config.cache.stale_while_revalidate = false;
        let service = service(config, &mock);

        service
            .cache
            .insert_entry(
                "coin_bitcoin",
                CacheEntry::with_timestamp(json!({"id": "bitcoin"}), now_millis() - 120_000),
            )
            .await;
        service.fetch_coin_details("ethereum").await.unwrap();

        let value = service.fetch_coin_details("bitcoin").await.unwrap();
        assert_eq!(value, json!({"id": "bitcoin"}));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_cached_value() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::status(503));
        let mut config = test_config();
        config.cache.stale_while_revalidate = false;
        let service = service(config, &mock);

        service
            .cache
            .insert_entry(
                TOP_COINS_CACHE_KEY,
                CacheEntry::with_timestamp(coins_payload(), now_millis() - 120_000),
            )
            .await;

        let value = service.fetch_top_coins().await.unwrap();
        assert_eq!(value, coins_payload());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_not_found_without_cache_surfaces() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::status(404));
        let service = service(test_config(), &mock);

        let err = service.fetch_coin_details("no-such-coin").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_typed_accessors() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockReply::json(coins_payload()));
        mock.push(MockReply::json(json!({
            "prices": [[1.0, 10.0], [2.0, 20.0]],
            "market_caps": [],
            "total_volumes": []
        })));
        let service = service(test_config(), &mock);

        let coins = service.top_coins().await.unwrap();
        assert_eq!(coins.len(), 2);
        assert_eq!(coins[1].symbol, "eth");

        let chart = service.market_chart("bitcoin", 2).await.unwrap();
        assert_eq!(chart.prices.len(), 2);
        assert_eq!(chart.price_changes().unwrap().current_price, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_lifecycle() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::json(coins_payload()));
        let service = service(test_config(), &mock);
        assert!(!service.is_polling());

        service.start();
        service.start();
        sleep(Duration::from_millis(1)).await;
        assert!(service.is_polling());
        assert_eq!(mock.call_count(), 1);
        assert_eq!(
            service.cache.peek(TOP_COINS_CACHE_KEY).await.unwrap().data,
            coins_payload()
        );

        sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.call_count(), 2);

        service.stop();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(mock.call_count(), 2);
        assert!(!service.status().await.polling);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mock = Arc::new(MockTransport::new());
        let mut config = test_config();
        config.rate_limit.max_requests = 0;

        let result = MarketDataService::with_transport(config, mock, None);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_stale_read_refreshes_in_background() {
        let mock = Arc::new(MockTransport::new());
        mock.push(MockReply::json(json!({"id": "bitcoin", "v": 2})));
        let service = service(test_config(), &mock);
        service
            .cache
            .insert_entry(
                "coin_bitcoin",
                CacheEntry::with_timestamp(json!({"id": "bitcoin", "v": 1}), now_millis() - 120_000),
            )
            .await;
        let mut events = service.subscribe();

        let value = service.fetch_coin_details("bitcoin").await.unwrap();
        assert_eq!(value, json!({"id": "bitcoin", "v": 1}));

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), "ENTRY_UPDATED");
        assert_eq!(event.key(), "coin_bitcoin");
        assert_eq!(
            service.fetch_coin_details("bitcoin").await.unwrap(),
            json!({"id": "bitcoin", "v": 2})
        );
        assert_eq!(mock.call_count(), 1);
        assert_eq!(service.status().await.rate_limit.current_requests, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_background_refresh_keeps_stale_value() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::json(json!({})));
        let mut config = test_config();
        config.rate_limit.max_requests = 1;
        let service = service(config, &mock);

        let stale = CacheEntry::with_timestamp(json!({"id": "bitcoin"}), now_millis() - 120_000);
        service
            .cache
            .insert_entry("coin_bitcoin", stale.clone())
            .await;
        service.fetch_coin_details("ethereum").await.unwrap();
        let mut events = service.subscribe();

        let value = service.fetch_coin_details("bitcoin").await.unwrap();
        assert_eq!(value, json!({"id": "bitcoin"}));

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), "FETCH_FAILED");
        assert_eq!(event.key(), "coin_bitcoin");
        assert!(event.to_string().contains("Rate limit exceeded"));
        assert_eq!(service.cache.peek("coin_bitcoin").await, Some(stale));
        assert_eq!(mock.call_count(), 1);
    }
}
