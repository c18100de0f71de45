//! Types for the market data client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A cached API payload and the moment it was fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The JSON payload as returned by the API
    pub data: Value,

    /// Fetch time in milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time
    pub fn new(data: Value) -> Self {
        Self {
            data,
            timestamp: now_millis(),
        }
    }

    /// Creates an entry with an explicit timestamp
    pub fn with_timestamp(data: Value, timestamp: i64) -> Self {
        Self { data, timestamp }
    }

    /// Age of the entry, zero if the timestamp lies in the future
    pub fn age(&self) -> Duration {
        Duration::from_millis((now_millis() - self.timestamp).max(0) as u64)
    }

    /// Check if the entry is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        now_millis() - self.timestamp > max_age.as_millis() as i64
    }
}

/// Notifications published by the cache store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheEvent {
    /// A fetch replaced the entry for `key`
    EntryUpdated {
        id: Uuid,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A fetch for `key` failed, any previous entry was kept
    FetchFailed {
        id: Uuid,
        key: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    pub(crate) fn entry_updated(key: &str) -> Self {
        Self::EntryUpdated {
            id: Uuid::new_v4(),
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn fetch_failed(key: &str, error_message: impl Into<String>) -> Self {
        Self::FetchFailed {
            id: Uuid::new_v4(),
            key: key.to_string(),
            error_message: error_message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event ID
    pub fn id(&self) -> Uuid {
        match self {
            CacheEvent::EntryUpdated { id, .. } => *id,
            CacheEvent::FetchFailed { id, .. } => *id,
        }
    }

    /// Cache key the event refers to
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::EntryUpdated { key, .. } => key,
            CacheEvent::FetchFailed { key, .. } => key,
        }
    }

    /// Get the event type as string
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::EntryUpdated { .. } => "ENTRY_UPDATED",
            CacheEvent::FetchFailed { .. } => "FETCH_FAILED",
        }
    }
}

impl std::fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheEvent::EntryUpdated { key, .. } => write!(f, "Cache entry updated: {}", key),
            CacheEvent::FetchFailed {
                key, error_message, ..
            } => write!(f, "Cache fetch failed for {}: {}", key, error_message),
        }
    }
}

/// One row of the markets listing
///
/// Only the fields the dashboard reads; everything else in the payload is
/// ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinMarket {
    pub id: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub market_cap_rank: Option<u32>,
    #[serde(default)]
    pub total_volume: Option<f64>,
    #[serde(default)]
    pub price_change_percentage_24h: Option<f64>,
}

/// Historical series for one coin, each point is `[unix_ms, value]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketChart {
    #[serde(default)]
    pub prices: Vec<[f64; 2]>,
    #[serde(default)]
    pub market_caps: Vec<[f64; 2]>,
    #[serde(default)]
    pub total_volumes: Vec<[f64; 2]>,
}

/// Price movement derived from a chart series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceChanges {
    /// Last price in the series
    pub current_price: f64,
    /// Percent change against the point closest to 24h before `now_ms`
    pub change_24h: f64,
    /// Percent change across the whole series
    pub change_period: f64,
}

impl MarketChart {
    /// Computes price changes relative to the current time
    pub fn price_changes(&self) -> Option<PriceChanges> {
        self.price_changes_at(now_millis())
    }

    /// Computes price changes relative to `now_ms`
    ///
    /// Returns `None` for an empty series or when a reference price is zero.
    pub fn price_changes_at(&self, now_ms: i64) -> Option<PriceChanges> {
        let first = self.prices.first()?[1];
        let last = self.prices.last()?[1];
        let day_ago = (now_ms - 24 * 60 * 60 * 1000) as f64;

        let price_24h_ago = self
            .prices
            .iter()
            .min_by(|a, b| {
                (a[0] - day_ago)
                    .abs()
                    .partial_cmp(&(b[0] - day_ago).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?[1];

        if first == 0.0 || price_24h_ago == 0.0 {
            return None;
        }

        Some(PriceChanges {
            current_price: last,
            change_24h: (last - price_24h_ago) / price_24h_ago * 100.0,
            change_period: (last - first) / first * 100.0,
        })
    }
}
