//! Asset price lookup for the manual-review audit threshold.
//!
//! Valuations only gate transfers against a configured ceiling, so a short
//! cache TTL is acceptable and keeps the price endpoint off the hot path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyre::{eyre, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current USD price of one whole unit of `symbol`.
    async fn price_usd(&self, symbol: &str) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: String,
}

/// Price endpoint client: GET `{base_url}/price?symbol=X` returning
/// `{"price": "..."}`.
pub struct HttpPriceSource {
    base_url: String,
    client: Client,
}

impl HttpPriceSource {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn price_usd(&self, symbol: &str) -> Result<f64> {
        let response: PriceResponse = self
            .client
            .get(format!("{}/price", self.base_url))
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .price
            .parse()
            .map_err(|e| eyre!("bad price {:?} for {symbol}: {e}", response.price))
    }
}

/// TTL cache in front of any `PriceSource`.
pub struct CachedPriceSource<S> {
    inner: S,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, f64)>>,
}

impl<S: PriceSource> CachedPriceSource<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S: PriceSource> PriceSource for CachedPriceSource<S> {
    async fn price_usd(&self, symbol: &str) -> Result<f64> {
        {
            let cache = self.cache.lock().await;
            if let Some((at, price)) = cache.get(symbol) {
                if at.elapsed() < self.ttl {
                    return Ok(*price);
                }
            }
        }

        let price = self.inner.price_usd(symbol).await?;
        debug!(symbol, price, "refreshed cached price");
        self.cache
            .lock()
            .await
            .insert(symbol.to_string(), (Instant::now(), price));
        Ok(price)
    }
}
