use market_data_client::constants::DEFAULT_CHART_DAYS;
use market_data_client::{ClientConfig, FileStorage, MarketDataService};
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Build the service with a cache file next to the working directory
    let config = ClientConfig::from_env()?;
    let storage = Arc::new(FileStorage::new("market_data_cache.json"));
    let service = MarketDataService::with_storage(config, storage)?;

    println!("Market Data Client Demo ({})", service.config().api.base_url);
    println!("-------------------------------------------");

    // 2. Top coins, first call goes to the network unless the cache file is fresh
    println!("1. Fetching top coins...");
    let start = Instant::now();
    let coins = match service.top_coins().await {
        Ok(coins) => coins,
        Err(e) => {
            eprintln!("   Error: Could not retrieve top coins: {}", e);
            return Ok(());
        }
    };
    println!("   Latency: {:?}", start.elapsed());
    for coin in coins.iter().take(10) {
        println!(
            "   #{:<4} {:<8} ${:<14.4} {:>8.2}%",
            coin.market_cap_rank.unwrap_or_default(),
            coin.symbol.to_uppercase(),
            coin.current_price.unwrap_or_default(),
            coin.price_change_percentage_24h.unwrap_or_default()
        );
    }
    println!();

    // 3. Same call again, now served from memory
    println!("2. Fetching top coins again (cached)...");
    let start = Instant::now();
    service.fetch_top_coins().await?;
    println!("   Latency: {:?}", start.elapsed());
    println!();

    // 4. Chart for the top coin
    if let Some(top) = coins.first() {
        println!("3. {}-day chart for {}...", DEFAULT_CHART_DAYS, top.name);
        match service.market_chart(&top.id, DEFAULT_CHART_DAYS).await {
            Ok(chart) => match chart.price_changes() {
                Some(changes) => {
                    println!("   Current: ${:.4}", changes.current_price);
                    println!("   24h:     {:.2}%", changes.change_24h);
                    println!("   Period:  {:.2}%", changes.change_period);
                }
                None => println!("   Chart has no usable prices"),
            },
            Err(e) => eprintln!("   Error: {}", e),
        }
        println!();
    }

    // 5. Diagnostics
    let status = service.status().await;
    println!("-------------------------------------------");
    println!(
        "Rate limit: {}/{} requests in window",
        status.rate_limit.current_requests, status.rate_limit.max_requests
    );
    println!("Cached keys: {:?}", status.cache.keys);

    Ok(())
}
