//! Pooled SQLite time-series store: schema init, staging-table bulk upsert, and the
//! coverage queries the backfiller uses to find gaps.
//!
//! Grounded on the teacher's `DatabaseManager` (`examples/venantvr-.../src/database.rs`)
//! for the `CREATE TABLE IF NOT EXISTS` schema style and the one-struct-one-resource
//! shape, generalized from a single `Connection` to an `r2d2_sqlite` pool so every
//! collector and the backfiller share one bounded set of connections instead of one
//! file handle per process.

use crate::error::{DatacatError, Result};
use crate::model::{CandleRow, GapInfo, MetricsRow};
use chrono::NaiveDate;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

pub type ConnPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Store {
    pool: ConnPool,
}

impl Store {
    pub fn open(database_url: &str) -> Result<Self> {
        let path = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(database_url);
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .idle_timeout(Some(Duration::from_secs(600)))
            .connection_timeout(Duration::from_secs(30))
            .build(manager)?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS candles (
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                bucket_ts INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                quote_volume REAL NOT NULL,
                trade_count INTEGER NOT NULL,
                taker_buy_volume REAL NOT NULL,
                taker_buy_quote_volume REAL NOT NULL,
                is_closed INTEGER NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (exchange, symbol, interval, bucket_ts)
            );
            CREATE TABLE IF NOT EXISTS metrics (
                symbol TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                sum_open_interest REAL,
                sum_open_interest_value REAL,
                count_toptrader_long_short_ratio REAL,
                sum_toptrader_long_short_ratio REAL,
                count_long_short_ratio REAL,
                sum_taker_long_short_vol_ratio REAL,
                source TEXT NOT NULL,
                is_closed INTEGER NOT NULL,
                PRIMARY KEY (symbol, create_time)
            );
            CREATE INDEX IF NOT EXISTS idx_candles_symbol_ts ON candles(symbol, interval, bucket_ts);",
        )?;
        Ok(())
    }

    /// Bulk-upserts candles through a staging table so a batch either lands whole or
    /// not at all, then merges staging into `candles` on the natural key
    /// `(exchange, symbol, interval, bucket_ts)` (spec §4.2, §8 invariant: idempotent
    /// writes never regress a closed candle back to provisional).
    pub fn upsert_candles(&self, interval: &str, rows: &[CandleRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS candles_staging (
                exchange TEXT, symbol TEXT, interval TEXT, bucket_ts INTEGER,
                open REAL, high REAL, low REAL, close REAL, volume REAL,
                quote_volume REAL, trade_count INTEGER, taker_buy_volume REAL,
                taker_buy_quote_volume REAL, is_closed INTEGER, source TEXT
            );
            DELETE FROM candles_staging;",
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO candles_staging VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
            )?;
            for r in rows {
                stmt.execute(rusqlite::params![
                    r.exchange,
                    r.symbol,
                    interval,
                    r.bucket_ts,
                    r.open,
                    r.high,
                    r.low,
                    r.close,
                    r.volume,
                    r.quote_volume,
                    r.trade_count,
                    r.taker_buy_volume,
                    r.taker_buy_quote_volume,
                    r.is_closed,
                    r.source,
                ])?;
            }
        }
        // `LIMIT -1` is a no-op that stops sqlite's parser from reading the upsert's
        // `ON CONFLICT` as a join condition on the preceding `FROM` clause.
        let affected = tx.execute(
            "INSERT INTO candles (
                exchange, symbol, interval, bucket_ts, open, high, low, close,
                volume, quote_volume, trade_count, taker_buy_volume,
                taker_buy_quote_volume, is_closed, source
             )
             SELECT * FROM candles_staging LIMIT -1
             ON CONFLICT(exchange, symbol, interval, bucket_ts) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                quote_volume = excluded.quote_volume,
                trade_count = excluded.trade_count,
                taker_buy_volume = excluded.taker_buy_volume,
                taker_buy_quote_volume = excluded.taker_buy_quote_volume,
                is_closed = excluded.is_closed,
                source = excluded.source
             WHERE excluded.is_closed >= candles.is_closed",
            [],
        )?;
        tx.execute("DELETE FROM candles_staging", [])?;
        tx.commit()?;
        Ok(affected)
    }

    pub fn upsert_metrics(&self, rows: &[MetricsRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics VALUES (?,?,?,?,?,?,?,?,?,?)
                 ON CONFLICT(symbol, create_time) DO UPDATE SET
                    sum_open_interest = excluded.sum_open_interest,
                    sum_open_interest_value = excluded.sum_open_interest_value,
                    count_toptrader_long_short_ratio = excluded.count_toptrader_long_short_ratio,
                    sum_toptrader_long_short_ratio = excluded.sum_toptrader_long_short_ratio,
                    count_long_short_ratio = excluded.count_long_short_ratio,
                    sum_taker_long_short_vol_ratio = excluded.sum_taker_long_short_vol_ratio,
                    source = excluded.source,
                    is_closed = excluded.is_closed",
            )?;
            for r in rows {
                affected += stmt.execute(rusqlite::params![
                    r.symbol,
                    r.create_time,
                    r.sum_open_interest,
                    r.sum_open_interest_value,
                    r.count_toptrader_long_short_ratio,
                    r.sum_toptrader_long_short_ratio,
                    r.count_long_short_ratio,
                    r.sum_taker_long_short_vol_ratio,
                    r.source,
                    r.is_closed,
                ])?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    /// Row count for `symbol` on `date` (UTC) at `interval`, used by the backfiller to
    /// decide whether a day is a gap (spec §4.6.1).
    pub fn coverage(&self, symbol: &str, interval: &str, date: NaiveDate) -> Result<i64> {
        let conn = self.pool.get()?;
        let day_start = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| DatacatError::data("invalid date"))?
            .and_utc()
            .timestamp_millis();
        let day_end = day_start + 86_400_000;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM candles
             WHERE symbol = ?1 AND interval = ?2 AND bucket_ts >= ?3 AND bucket_ts < ?4",
            rusqlite::params![symbol, interval, day_start, day_end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn find_gaps(
        &self,
        symbol: &str,
        interval: &str,
        dates: &[NaiveDate],
        expected_per_day: i64,
    ) -> Result<Vec<GapInfo>> {
        let mut gaps = Vec::new();
        for &date in dates {
            let actual = self.coverage(symbol, interval, date)?;
            if GapInfo::is_gap(expected_per_day, actual) {
                gaps.push(GapInfo {
                    symbol: symbol.to_string(),
                    date,
                    expected: expected_per_day,
                    actual,
                });
            }
        }
        Ok(gaps)
    }

    /// Row count for `symbol` on `date` (UTC) in the `metrics` table, the 5-minute
    /// analogue of `coverage` used to detect metrics gaps (spec §4.6.3).
    pub fn metrics_coverage(&self, symbol: &str, date: NaiveDate) -> Result<i64> {
        let conn = self.pool.get()?;
        let day_start = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| DatacatError::data("invalid date"))?
            .and_utc()
            .timestamp_millis();
        let day_end = day_start + 86_400_000;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metrics
             WHERE symbol = ?1 AND create_time >= ?2 AND create_time < ?3",
            rusqlite::params![symbol, day_start, day_end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn find_metrics_gaps(
        &self,
        symbol: &str,
        dates: &[NaiveDate],
        expected_per_day: i64,
    ) -> Result<Vec<GapInfo>> {
        let mut gaps = Vec::new();
        for &date in dates {
            let actual = self.metrics_coverage(symbol, date)?;
            if GapInfo::is_gap(expected_per_day, actual) {
                gaps.push(GapInfo {
                    symbol: symbol.to_string(),
                    date,
                    expected: expected_per_day,
                    actual,
                });
            }
        }
        Ok(gaps)
    }

    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn sample_row(symbol: &str, bucket_ts: i64) -> CandleRow {
        CandleRow {
            exchange: "binance".into(),
            symbol: symbol.into(),
            bucket_ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 100.0,
            quote_volume: 150.0,
            trade_count: 10,
            taker_buy_volume: 50.0,
            taker_buy_quote_volume: 75.0,
            is_closed: true,
            source: Source::BinanceWs.to_string(),
        }
    }

    #[test]
    fn upsert_is_idempotent_and_merges_on_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = Store::open(db_path.to_str().unwrap()).unwrap();

        let row = sample_row("BTCUSDT", 1_700_000_000_000);
        assert_eq!(store.upsert_candles("1m", std::slice::from_ref(&row)).unwrap(), 1);

        let mut updated = row.clone();
        updated.close = 9.9;
        store.upsert_candles("1m", &[updated]).unwrap();

        let conn = store.pool.get().unwrap();
        let close: f64 = conn
            .query_row("SELECT close FROM candles WHERE symbol = 'BTCUSDT'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(close, 9.9);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM candles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn coverage_counts_rows_within_the_utc_day() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = Store::open(db_path.to_str().unwrap()).unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day_start = date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
        let rows: Vec<_> = (0..1000)
            .map(|i| sample_row("ETHUSDT", day_start + i * 60_000))
            .collect();
        store.upsert_candles("1m", &rows).unwrap();

        let coverage = store.coverage("ETHUSDT", "1m", date).unwrap();
        assert_eq!(coverage, 1000);

        let gaps = store.find_gaps("ETHUSDT", "1m", &[date], 1440).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].actual, 1000);
    }
}
