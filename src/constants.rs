//! Default settings for the market data client
//!
//! These are the values `ClientConfig::default()` is built from. Anything
//! deployment specific (API key, base URL) can be overridden through the
//! environment, see `config::ClientConfig::from_env`.

/// CoinGecko API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Header CoinGecko expects the demo API key in
pub const DEFAULT_API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// HTTP request timeout (in milliseconds)
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Total attempts per logical request, including the first one
pub const RETRY_ATTEMPTS: u32 = 3;

/// Logical requests allowed on the wire at once
pub const MAX_CONCURRENT_REQUESTS: usize = 5;

/// Base delay between attempts (in milliseconds), multiplied by the attempt number
pub const RETRY_DELAY_MS: u64 = 1_000;

/// How long a cache entry stays fresh (in milliseconds)
pub const CACHE_DURATION_MS: u64 = 60_000;

/// Namespace for every persisted cache entry
pub const STORAGE_KEY_PREFIX: &str = "crypto_dashboard_cache:";

/// Maximum outbound requests per rate limit window
pub const RATE_LIMIT_MAX_REQUESTS: usize = 10;

/// Rate limit window (in milliseconds)
pub const RATE_LIMIT_WINDOW_MS: u64 = 60_000;

/// How often the poller refreshes the top coins list (in seconds)
pub const POLL_INTERVAL_SECS: u64 = 60;

/// Longest coin id accepted by the accessors
pub const MAX_COIN_ID_LENGTH: usize = 50;

/// Quote currency for every market query
pub const VS_CURRENCY: &str = "usd";

/// Page size of the markets listing
pub const TOP_COINS_PER_PAGE: u32 = 100;

/// History window used when callers don't pick one
pub const DEFAULT_CHART_DAYS: u32 = 7;

/// Cache key of the markets listing
pub const TOP_COINS_CACHE_KEY: &str = "top_coins";

/// User agent for HTTP requests
pub const USER_AGENT: &str = "market-data-client/0.1.0";

/// Capacity of the cache event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
