//! Environment-driven configuration, loaded once at process startup.
//!
//! Mirrors `original_source/.../src/config.py`'s `settings` singleton: one struct,
//! read from the environment (with an optional local `.env` via `dotenvy`), with hard
//! caps on the two rate-limiter knobs enforced by clamping rather than documentation
//! alone.

use crate::error::{DatacatError, Result};
use std::path::PathBuf;
use std::time::Duration;

const MAX_RATE_PER_MINUTE: u32 = 2400;
const MAX_CONCURRENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillMode {
    None,
    Days,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub rate_per_minute: u32,
    pub max_concurrent: u32,

    pub http_proxy: Option<String>,

    pub backfill_mode: BackfillMode,
    pub backfill_days: u32,
    pub backfill_start_date: Option<String>,
    pub backfill_on_start: bool,

    pub symbols_exclude: Vec<String>,
    pub symbols_extra: Vec<String>,
    pub symbols_groups: Option<Vec<String>>,

    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<String>,
    pub log_dir: Option<PathBuf>,

    pub data_dir: PathBuf,
    pub output_mode: OutputMode,

    /// Opt-in REST snapshot at WS startup — see DESIGN.md, Open Question 1.
    pub rest_snapshot_on_start: bool,

    /// Gap watcher sleep interval (spec §4.5, default 60 s).
    pub ws_gap_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Store,
    Json,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = env_opt("DATACAT_DATABASE_URL")
            .or_else(|| env_opt("DATABASE_URL"))
            .ok_or_else(|| {
                DatacatError::config("DATABASE_URL or DATACAT_DATABASE_URL must be set")
            })?;

        let rate_per_minute = env_opt("DATACAT_RATE_LIMIT_PER_MINUTE")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1200)
            .min(MAX_RATE_PER_MINUTE);

        let max_concurrent = env_opt("DATACAT_MAX_CONCURRENT")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(8)
            .min(MAX_CONCURRENT);

        let http_proxy = env_opt("DATACAT_HTTP_PROXY").or_else(|| env_opt("HTTP_PROXY"));

        let backfill_mode = match env_opt("BACKFILL_MODE").as_deref() {
            Some("days") => BackfillMode::Days,
            Some("all") => BackfillMode::All,
            _ => BackfillMode::None,
        };
        let backfill_days = env_opt("BACKFILL_DAYS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(7);
        let backfill_start_date = env_opt("BACKFILL_START_DATE");
        let backfill_on_start = env_bool("BACKFILL_ON_START", false);

        let symbols_exclude = env_csv("SYMBOLS_EXCLUDE");
        let symbols_extra = env_csv("SYMBOLS_EXTRA");
        let symbols_groups = env_opt("SYMBOLS_GROUPS").map(|_| env_csv("SYMBOLS_GROUPS"));

        let log_level = env_opt("DATACAT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_format = match env_opt("DATACAT_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        };
        let log_file = env_opt("DATACAT_LOG_FILE");
        let log_dir = env_opt("DATACAT_LOG_DIR").map(PathBuf::from);

        let data_dir = env_opt("DATACAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let output_mode = match env_opt("DATACAT_OUTPUT_MODE").as_deref() {
            Some("json") => OutputMode::Json,
            _ => OutputMode::Store,
        };

        let rest_snapshot_on_start = env_bool("DATACAT_REST_SNAPSHOT_ON_START", false);

        let ws_gap_interval = Duration::from_secs(
            env_opt("DATACAT_WS_GAP_INTERVAL_SECS").and_then(|v| v.parse::<u64>().ok()).unwrap_or(60),
        );

        Ok(Self {
            database_url,
            rate_per_minute,
            max_concurrent,
            http_proxy,
            backfill_mode,
            backfill_days,
            backfill_start_date,
            backfill_on_start,
            symbols_exclude,
            symbols_extra,
            symbols_groups,
            log_level,
            log_format,
            log_file,
            log_dir,
            data_dir,
            output_mode,
            rest_snapshot_on_start,
            ws_gap_interval,
        })
    }

    pub fn rate_limit_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.data_dir.clone())
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn json_dir(&self) -> PathBuf {
        self.data_dir.join("json")
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(50)
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_opt(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_csv(name: &str) -> Vec<String> {
    env_opt(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parses_and_uppercases() {
        unsafe {
            std::env::set_var("TEST_CSV_FIELD", "btcusdt, ethusdt ,,solusdt");
        }
        assert_eq!(
            env_csv("TEST_CSV_FIELD"),
            vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]
        );
        unsafe {
            std::env::remove_var("TEST_CSV_FIELD");
        }
    }

    #[test]
    fn rate_caps_are_enforced() {
        unsafe {
            std::env::set_var("DATACAT_DATABASE_URL", "sqlite://test.db");
            std::env::set_var("DATACAT_RATE_LIMIT_PER_MINUTE", "999999");
            std::env::set_var("DATACAT_MAX_CONCURRENT", "999");
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.rate_per_minute, MAX_RATE_PER_MINUTE);
        assert_eq!(cfg.max_concurrent, MAX_CONCURRENT);
        unsafe {
            std::env::remove_var("DATACAT_DATABASE_URL");
            std::env::remove_var("DATACAT_RATE_LIMIT_PER_MINUTE");
            std::env::remove_var("DATACAT_MAX_CONCURRENT");
        }
    }
}
