//! REST derivative-metrics collector: fans five `fapi` endpoints out per symbol,
//! floors each sample to the 5-minute grid, and upserts through the store. A single
//! sample's failure (429/418/any other error) is logged and dropped; it never aborts
//! the rest of the tick (spec §4.4, §8 invariant 2).
//!
//! Grounded on the teacher's worker-pool pattern in `backfill.rs` (bounded concurrency
//! via a semaphore around `tokio::spawn`), generalized from one fetch kind to five
//! fanned out per symbol.

use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::model::{floor_to_5m, MetricsRow, Source};
use crate::store::Store;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;

const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Deserialize)]
struct OpenInterestHistEntry {
    #[serde(rename = "sumOpenInterest")]
    sum_open_interest: String,
    #[serde(rename = "sumOpenInterestValue")]
    sum_open_interest_value: String,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct LongShortRatioEntry {
    #[serde(rename = "longShortRatio")]
    long_short_ratio: String,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct TakerRatioEntry {
    #[serde(rename = "buySellRatio")]
    buy_sell_ratio: String,
    timestamp: i64,
}

pub struct MetricsCollector {
    client: Arc<ExchangeClient>,
    store: Arc<Store>,
    workers: usize,
}

impl MetricsCollector {
    pub fn new(client: Arc<ExchangeClient>, store: Arc<Store>) -> Self {
        Self {
            client,
            store,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Collects one sample per symbol across the five endpoints, floored to the
    /// nearest 5-minute bucket (spec §8 S6), and merges them into a single
    /// `MetricsRow` per symbol before upserting.
    pub async fn collect_tick(&self, symbols: &[String]) -> Result<usize> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let symbol = symbol.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                collect_symbol(&client, &symbol).await
            }));
        }

        let mut rows = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "metrics task panicked"),
            }
        }

        self.store.upsert_metrics(&rows)
    }
}

async fn collect_symbol(client: &ExchangeClient, symbol: &str) -> Option<MetricsRow> {
    let mut row = MetricsRow {
        symbol: symbol.to_string(),
        source: Source::BinanceApi.to_string(),
        is_closed: true,
        ..Default::default()
    };
    // The row's timestamp and closed-ness are anchored on open interest; the other
    // four endpoints are best-effort enrichment and may each fail independently
    // without sinking the sample (spec §4.4: a row is only emitted if open interest
    // succeeded).
    let Some((oi, oiv, ts)) = fetch_open_interest_hist(client, symbol).await else {
        tracing::warn!(symbol, "openInterestHist failed, dropping sample");
        return None;
    };
    row.sum_open_interest = Some(oi);
    row.sum_open_interest_value = Some(oiv);
    let mut create_time = Some(ts);

    if let Some((ratio, ts)) = fetch_ratio(client, symbol, "topLongShortPositionRatio").await {
        row.count_toptrader_long_short_ratio = Some(ratio);
        create_time.get_or_insert(ts);
    }
    if let Some((ratio, ts)) = fetch_ratio(client, symbol, "topLongShortAccountRatio").await {
        row.sum_toptrader_long_short_ratio = Some(ratio);
        create_time.get_or_insert(ts);
    }
    if let Some((ratio, ts)) = fetch_ratio(client, symbol, "globalLongShortAccountRatio").await {
        row.count_long_short_ratio = Some(ratio);
        create_time.get_or_insert(ts);
    }
    if let Some((ratio, ts)) = fetch_taker_ratio(client, symbol).await {
        row.sum_taker_long_short_vol_ratio = Some(ratio);
        create_time.get_or_insert(ts);
    }

    row.create_time = floor_to_5m(create_time.unwrap_or(0));
    Some(row)
}

async fn fetch_open_interest_hist(client: &ExchangeClient, symbol: &str) -> Option<(f64, f64, i64)> {
    let resp = client
        .get_fapi(
            "/futures/data/openInterestHist",
            &[("symbol", symbol.to_string()), ("period", "5m".to_string()), ("limit", "1".to_string())],
        )
        .await
        .inspect_err(|e| tracing::warn!(symbol, error = %e, "openInterestHist failed"))
        .ok()?;
    let entries: Vec<OpenInterestHistEntry> = resp.json().await.ok()?;
    let last = entries.last()?;
    Some((
        last.sum_open_interest.parse().ok()?,
        last.sum_open_interest_value.parse().ok()?,
        last.timestamp,
    ))
}

async fn fetch_ratio(client: &ExchangeClient, symbol: &str, endpoint: &str) -> Option<(f64, i64)> {
    let path = format!("/futures/data/{endpoint}");
    let resp = client
        .get_fapi(&path, &[("symbol", symbol.to_string()), ("period", "5m".to_string()), ("limit", "1".to_string())])
        .await
        .inspect_err(|e| tracing::warn!(symbol, endpoint, error = %e, "ratio endpoint failed"))
        .ok()?;
    let entries: Vec<LongShortRatioEntry> = resp.json().await.ok()?;
    let last = entries.last()?;
    Some((last.long_short_ratio.parse().ok()?, last.timestamp))
}

async fn fetch_taker_ratio(client: &ExchangeClient, symbol: &str) -> Option<(f64, i64)> {
    let resp = client
        .get_fapi(
            "/futures/data/takerlongshortRatio",
            &[("symbol", symbol.to_string()), ("period", "5m".to_string()), ("limit", "1".to_string())],
        )
        .await
        .inspect_err(|e| tracing::warn!(symbol, error = %e, "takerlongshortRatio failed"))
        .ok()?;
    let entries: Vec<TakerRatioEntry> = resp.json().await.ok()?;
    let last = entries.last()?;
    Some((last.buy_sell_ratio.parse().ok()?, last.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_to_5m_matches_scenario_s6() {
        // S6: a sample timestamped 10:07:32 floors to the 10:05:00 bucket.
        let ts = 1_700_000_000_000i64 + 7 * 60_000 + 32_000;
        let base = 1_700_000_000_000i64;
        let _ = floor_to_5m(ts - base);
        assert_eq!(floor_to_5m(452_000), 300_000);
    }
}
