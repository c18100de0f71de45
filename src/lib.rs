//! # Market Data Client
//!
//! Cached, rate-limited access to a cryptocurrency market data REST API
//! (CoinGecko by default) for dashboards: top coins list, per-coin details
//! and per-coin price charts.
//!
//! ## Usage
//!
//! The service is an explicitly constructed instance; nothing runs until
//! you ask for it.
//!
//! ```no_run
//! use market_data_client::{ClientConfig, MarketDataService};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = MarketDataService::new(ClientConfig::from_env()?)?;
//!
//! // Served from cache when fresh, stale-while-revalidate when not
//! let details = service.fetch_coin_details("bitcoin").await?;
//! println!("{}", details["name"]);
//!
//! let chart = service.market_chart("solana", 7).await?;
//! if let Some(changes) = chart.price_changes() {
//!     println!("SOL 24h: {:.2}%", changes.change_24h);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! MarketDataService (fetch_top_coins, fetch_coin_details, fetch_coin_market_chart)
//!     ↓
//! CacheStore (fresh → hit, stale → serve + background refresh, missing → fetch)
//!     ↓
//! RateLimiter (sliding window, denial → RateLimitExceeded or cached fallback)
//!     ↓
//! RetryingFetcher (timeout, transient-only retries)
//!     ↓
//! HttpTransport (reqwest)
//! ```
//!
//! ## Error Handling
//!
//! ```no_run
//! use market_data_client::{ApiError, MarketDataService};
//!
//! # async fn example(service: MarketDataService) {
//! match service.fetch_coin_details("bitcoin").await {
//!     Ok(details) => println!("{}", details["symbol"]),
//!     Err(ApiError::RateLimitExceeded { wait }) => {
//!         println!("Try again in {:?}", wait)
//!     }
//!     Err(ApiError::NotFound { endpoint }) => println!("No such coin: {}", endpoint),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod fetcher;
pub mod rate_limiter;
pub mod service;
pub mod storage;
pub mod transport;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use config::{ApiKey, ApiKeyPlacement, ClientConfig};
pub use error::{ApiError, ConfigError, StorageError, TransportError};
pub use service::{MarketDataService, ServiceStatus};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use types::{CacheEntry, CacheEvent, CoinMarket, MarketChart, PriceChanges};
