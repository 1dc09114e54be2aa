//! WebSocket candle collector: a single event loop subscribed to Binance's combined
//! kline stream, coalescing incoming candles into a buffer that flushes on whichever
//! trigger fires first — size or time (spec §4.5, §8 S1/S2) — plus a background gap
//! watcher that notices missed candles and grows/shrinks its lookback window.
//!
//! Grounded on the teacher's `realtime.rs` (a `tokio-tungstenite` read loop driving a
//! broadcast channel, one task per connection) for the event-loop shape, and on
//! `parking_lot::Mutex` (from `cooprefr-bettersys/rust-backend`) for the coalescing
//! buffer guard in place of the teacher's `std::sync::Mutex`.

use crate::backfill::Backfiller;
use crate::model::{CandleRow, Interval, Source};
use crate::store::Store;
use chrono::{NaiveDate, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_MAX_BUFFER: usize = 1000;
const DEFAULT_FLUSH_WINDOW: Duration = Duration::from_secs(3);
const DEFAULT_GAP_INTERVAL: Duration = Duration::from_secs(60);
/// Lookback window in days (spec §4.5 "gap watcher").
const BASE_LOOKBACK_DAYS: i64 = 2;
const MAX_LOOKBACK_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
struct CombinedStreamEnvelope {
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "n")]
    trade_count: i64,
    #[serde(rename = "V")]
    taker_buy_volume: String,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Coalescing buffer shared between the WS read loop and the periodic flusher.
struct Buffer {
    rows: Vec<CandleRow>,
}

pub struct WsCollector {
    store: Arc<Store>,
    interval: Interval,
    max_buffer: usize,
    flush_window: Duration,
    buffer: Arc<Mutex<Buffer>>,
    flush_notify: Arc<Notify>,
    /// `(symbol, utc_day)` pairs the gap watcher gave up repairing this session
    /// (spec GLOSSARY "unfillable", §4.5).
    unfillable: Arc<Mutex<HashSet<(String, NaiveDate)>>>,
    backfiller: Option<Arc<Backfiller>>,
    gap_interval: Duration,
}

impl WsCollector {
    pub fn new(store: Arc<Store>, interval: Interval) -> Self {
        Self {
            store,
            interval,
            max_buffer: DEFAULT_MAX_BUFFER,
            flush_window: DEFAULT_FLUSH_WINDOW,
            buffer: Arc::new(Mutex::new(Buffer { rows: Vec::new() })),
            flush_notify: Arc::new(Notify::new()),
            unfillable: Arc::new(Mutex::new(HashSet::new())),
            backfiller: None,
            gap_interval: DEFAULT_GAP_INTERVAL,
        }
    }

    pub fn with_limits(mut self, max_buffer: usize, flush_window: Duration) -> Self {
        self.max_buffer = max_buffer;
        self.flush_window = flush_window;
        self
    }

    /// Enables the background gap watcher (spec §4.5); without this the collector
    /// only streams and coalesces, with no self-healing against missed candles.
    pub fn with_gap_watcher(mut self, backfiller: Arc<Backfiller>, gap_interval: Duration) -> Self {
        self.backfiller = Some(backfiller);
        self.gap_interval = gap_interval;
        self
    }

    fn stream_url(&self, symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_lowercase(), self.interval.as_str()))
            .collect();
        format!(
            "wss://fstream.binance.com/stream?streams={}",
            streams.join("/")
        )
    }

    /// Connects, reads frames forever, and pushes every kline into the coalescing
    /// buffer. A background task flushes on size or time, whichever comes first.
    pub async fn run(&self, symbols: Vec<String>) -> crate::error::Result<()> {
        let url = self.stream_url(&symbols);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| crate::error::DatacatError::external(format!("ws connect failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let flusher_buffer = self.buffer.clone();
        let flusher_store = self.store.clone();
        let flusher_notify = self.flush_notify.clone();
        let flush_window = self.flush_window;
        let interval_str = self.interval.as_str();
        let flusher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(flush_window) => {}
                    _ = flusher_notify.notified() => {}
                }
                flush(&flusher_buffer, &flusher_store, interval_str);
            }
        });

        let gap_watcher = self.backfiller.clone().map(|backfiller| {
            let symbols = symbols.clone();
            let unfillable = self.unfillable.clone();
            let gap_interval = self.gap_interval;
            tokio::spawn(run_gap_watcher(backfiller, symbols, unfillable, gap_interval))
        });

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| crate::error::DatacatError::external(format!("ws read failed: {e}")))?;
            match msg {
                Message::Text(text) => self.handle_text(&text),
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        flusher.abort();
        if let Some(handle) = gap_watcher {
            handle.abort();
        }
        flush(&self.buffer, &self.store, interval_str);
        Ok(())
    }

    fn handle_text(&self, text: &str) {
        let Ok(envelope) = serde_json::from_str::<CombinedStreamEnvelope>(text) else {
            return;
        };
        let row = to_candle_row(&envelope.data);
        let should_flush = {
            let mut buf = self.buffer.lock();
            buf.rows.push(row);
            buf.rows.len() >= self.max_buffer
        };
        if should_flush {
            self.flush_notify.notify_one();
        }
    }

    pub fn mark_unfillable(&self, symbol: &str, day: NaiveDate) {
        self.unfillable.lock().insert((symbol.to_string(), day));
    }

    pub fn is_unfillable(&self, symbol: &str, day: NaiveDate) -> bool {
        self.unfillable.lock().contains(&(symbol.to_string(), day))
    }
}

/// Background gap watcher (spec §4.5): sleeps, runs the backfiller over the
/// current symbol set, and grows/shrinks its lookback window based on whether
/// anything was gapped this cycle.
async fn run_gap_watcher(
    backfiller: Arc<Backfiller>,
    symbols: Vec<String>,
    unfillable: Arc<Mutex<HashSet<(String, NaiveDate)>>>,
    gap_interval: Duration,
) {
    let mut lookback_days = BASE_LOOKBACK_DAYS;
    loop {
        tokio::time::sleep(gap_interval).await;

        let start = Utc::now().date_naive() - chrono::Duration::days(lookback_days);
        let mut any_gap = false;

        for symbol in &symbols {
            let skip: HashSet<NaiveDate> = {
                let guard = unfillable.lock();
                guard
                    .iter()
                    .filter(|(s, _)| s == symbol)
                    .map(|(_, d)| *d)
                    .collect()
            };
            match backfiller.backfill_symbol_skipping(symbol, Interval::M1, start, &skip).await {
                Ok(still_unfillable) => {
                    if !still_unfillable.is_empty() {
                        any_gap = true;
                        let mut guard = unfillable.lock();
                        for gap in still_unfillable {
                            guard.insert((symbol.clone(), gap.date));
                        }
                    }
                }
                Err(e) => {
                    any_gap = true;
                    tracing::warn!(symbol, error = %e, "gap watcher backfill failed");
                }
            }
        }

        lookback_days = if any_gap {
            grow_lookback(lookback_days)
        } else {
            shrink_lookback(lookback_days)
        };
        tracing::debug!(lookback_days, any_gap, "gap watcher cycle complete");
    }
}

fn flush(buffer: &Arc<Mutex<Buffer>>, store: &Arc<Store>, interval: &str) {
    let rows = {
        let mut buf = buffer.lock();
        std::mem::take(&mut buf.rows)
    };
    if rows.is_empty() {
        return;
    }
    let n = rows.len();
    match store.upsert_candles(interval, &rows) {
        Ok(affected) => tracing::info!(interval, buffered = n, affected, "flushed ws candle buffer"),
        Err(e) => tracing::error!(interval, error = %e, "failed to flush ws candle buffer"),
    }
}

fn to_candle_row(event: &KlineEvent) -> CandleRow {
    let k = &event.kline;
    CandleRow {
        exchange: "binance".to_string(),
        symbol: event.symbol.clone(),
        bucket_ts: k.open_time,
        open: k.open.parse().unwrap_or(0.0),
        high: k.high.parse().unwrap_or(0.0),
        low: k.low.parse().unwrap_or(0.0),
        close: k.close.parse().unwrap_or(0.0),
        volume: k.volume.parse().unwrap_or(0.0),
        quote_volume: k.quote_volume.parse().unwrap_or(0.0),
        trade_count: k.trade_count,
        taker_buy_volume: k.taker_buy_volume.parse().unwrap_or(0.0),
        taker_buy_quote_volume: k.taker_buy_quote_volume.parse().unwrap_or(0.0),
        is_closed: k.is_closed,
        source: Source::BinanceWs.to_string(),
    }
}

/// Grows the gap watcher's lookback window by one day after a cycle with a gap,
/// capped at `MAX_LOOKBACK_DAYS` (spec §4.5 "grow it by 1 day").
pub fn grow_lookback(current: i64) -> i64 {
    (current + 1).min(MAX_LOOKBACK_DAYS)
}

/// Shrinks the lookback window by one day after a clean cycle, floored at 1 day
/// (spec §4.5 "shrink the lookback by 1 day (floor 1)").
pub fn shrink_lookback(current: i64) -> i64 {
    (current - 1).max(1)
}

pub fn reset_lookback() -> i64 {
    BASE_LOOKBACK_DAYS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_flushes_at_max_size() {
        let store_dir = tempfile::tempdir().unwrap();
        let db_path = store_dir.path().join("test.db");
        let store = Arc::new(Store::open(db_path.to_str().unwrap()).unwrap());
        let collector = WsCollector::new(store.clone(), Interval::M1).with_limits(2, Duration::from_secs(300));

        let make_text = |open_time: i64| {
            serde_json::json!({
                "data": {
                    "s": "BTCUSDT",
                    "k": {
                        "t": open_time, "o": "1.0", "h": "2.0", "l": "0.5", "c": "1.5",
                        "v": "10.0", "q": "15.0", "n": 3, "V": "5.0", "Q": "7.5", "x": true
                    }
                }
            })
            .to_string()
        };

        collector.handle_text(&make_text(1_700_000_000_000));
        assert_eq!(collector.buffer.lock().rows.len(), 1);
        collector.handle_text(&make_text(1_700_000_060_000));
        // second push hit max_buffer=2 and should have notified the flusher; the
        // buffer itself isn't cleared until `flush` runs, which this unit test
        // doesn't drive (that's covered by the size-vs-window integration path).
        assert_eq!(collector.buffer.lock().rows.len(), 2);
    }

    #[test]
    fn lookback_grows_and_shrinks_per_spec_4_5() {
        let mut window = reset_lookback();
        window = grow_lookback(window);
        window = grow_lookback(window);
        assert_eq!(window, BASE_LOOKBACK_DAYS + 2);

        for _ in 0..20 {
            window = grow_lookback(window);
        }
        assert_eq!(window, MAX_LOOKBACK_DAYS);

        for _ in 0..20 {
            window = shrink_lookback(window);
        }
        assert_eq!(window, 1);
        assert_eq!(reset_lookback(), BASE_LOOKBACK_DAYS);
    }

    #[test]
    fn unfillable_tracks_symbol_and_day_pairs() {
        let store_dir = tempfile::tempdir().unwrap();
        let db_path = store_dir.path().join("test.db");
        let store = Arc::new(Store::open(db_path.to_str().unwrap()).unwrap());
        let collector = WsCollector::new(store, Interval::M1);
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        assert!(!collector.is_unfillable("BTCUSDT", day));
        collector.mark_unfillable("BTCUSDT", day);
        assert!(collector.is_unfillable("BTCUSDT", day));
        assert!(!collector.is_unfillable("ETHUSDT", day));
    }
}
