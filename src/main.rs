//! CLI orchestrator. Each subcommand wires the shared config/store/rate-limiter/
//! exchange-client stack into one collector or tool, following the teacher's
//! single-binary-many-modes shape but replaced with `clap`'s derive subcommands
//! instead of the teacher's positional-argument dispatch in `main.rs`.

use clap::{Args, Parser, Subcommand};
use datacat_collector::config::Config;
use datacat_collector::error::{safe_main, DatacatError, Result};
use datacat_collector::exchange::ExchangeClient;
use datacat_collector::model::{GapInfo, Interval};
use datacat_collector::rate_limiter::RateLimiter;
use datacat_collector::store::Store;
use datacat_collector::symbols;
use datacat_collector::ws_collector::WsCollector;
use datacat_collector::{backfill::Backfiller, metrics_collector::MetricsCollector};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "datacat", about = "Binance USDT-M perpetual futures collector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Shared `--days`/`--klines`/`--metrics`/`--all`/`--symbols` flags for
/// `crypto-backfill` and `crypto-scan` (spec §6.2).
#[derive(Args, Clone)]
struct GapFlags {
    #[arg(long)]
    symbols: Option<String>,
    #[arg(long)]
    start_date: Option<String>,
    #[arg(long)]
    days: Option<u32>,
    #[arg(long)]
    klines: bool,
    #[arg(long)]
    metrics: bool,
    #[arg(long)]
    all: bool,
}

impl GapFlags {
    /// `--all`, or neither `--klines` nor `--metrics` given, means both; otherwise
    /// whichever of the two was named.
    fn targets(&self) -> (bool, bool) {
        if self.all || (!self.klines && !self.metrics) {
            (true, true)
        } else {
            (self.klines, self.metrics)
        }
    }

    fn start_date(&self, config: &Config) -> Result<chrono::NaiveDate> {
        match self.start_date.clone().or_else(|| config.backfill_start_date.clone()) {
            Some(s) => chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| DatacatError::config(format!("invalid start_date: {e}"))),
            None => {
                let days = self.days.unwrap_or(config.backfill_days);
                Ok((chrono::Utc::now() - chrono::Duration::days(days as i64)).date_naive())
            }
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Streams candles over the combined kline WebSocket and coalesces them to disk,
    /// with a background gap watcher running alongside it.
    Ws {
        #[arg(long, default_value = "1m")]
        interval: String,
    },
    /// Polls the five derivative-metrics REST endpoints on a 5-minute grid.
    Metrics {
        #[arg(long)]
        symbols: Option<String>,
    },
    /// Scans for coverage gaps and fills them via archive/REST tiers.
    Backfill {
        #[command(flatten)]
        flags: GapFlags,
    },
    /// Scan only, no writes: reports gaps without filling them.
    Scan {
        #[command(flatten)]
        flags: GapFlags,
    },
    /// Checks store connectivity and exchange reachability, prints a JSON report.
    Health,
}

fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    let _logging_guard = datacat_collector::logging::setup(&config, "datacat");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = safe_main("datacat", || runtime.block_on(run(config)));
    std::process::exit(code);
}

async fn run(config: Config) -> Result<()> {
    let cli = Cli::parse();

    let store = Arc::new(Store::open(&config.database_url)?);
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_dir(),
        config.rate_per_minute,
        config.max_concurrent,
    )?);
    let exchange = Arc::new(ExchangeClient::new(limiter, &config.http_proxy)?);

    tokio::select! {
        result = dispatch(cli.command, config, store, exchange) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            std::process::exit(130);
        }
    }
}

async fn dispatch(
    command: Command,
    config: Config,
    store: Arc<Store>,
    exchange: Arc<ExchangeClient>,
) -> Result<()> {
    match command {
        Command::Ws { interval } => {
            let interval = Interval::parse(&interval)
                .ok_or_else(|| DatacatError::config(format!("unknown interval {interval}")))?;
            let symbols = resolve_symbols(&config, &exchange, None).await?;
            tracing::info!(symbols = symbols.len(), %interval, "starting ws collector");
            let backfiller = Arc::new(Backfiller::new(exchange, store.clone()));
            let collector = WsCollector::new(store, interval).with_gap_watcher(backfiller, config.ws_gap_interval);
            collector.run(symbols).await
        }
        Command::Metrics { symbols } => {
            let symbols = resolve_symbols(&config, &exchange, symbols.as_deref()).await?;
            let collector = MetricsCollector::new(exchange, store);
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                ticker.tick().await;
                match collector.collect_tick(&symbols).await {
                    Ok(n) => tracing::info!(rows = n, "metrics tick complete"),
                    Err(e) => tracing::error!(error = %e, "metrics tick failed"),
                }
            }
        }
        Command::Backfill { flags } => {
            let symbols = resolve_symbols(&config, &exchange, flags.symbols.as_deref()).await?;
            let start = flags.start_date(&config)?;
            let (do_klines, do_metrics) = flags.targets();
            let backfiller = Backfiller::new(exchange, store);
            for symbol in &symbols {
                if do_klines {
                    let unfillable = backfiller.backfill_symbol(symbol, Interval::M1, start).await?;
                    if !unfillable.is_empty() {
                        tracing::warn!(symbol, count = unfillable.len(), "candle gaps remain unfillable");
                    }
                }
                if do_metrics {
                    let unfillable = backfiller.backfill_symbol_metrics(symbol, start).await?;
                    if !unfillable.is_empty() {
                        tracing::warn!(symbol, count = unfillable.len(), "metrics gaps remain unfillable");
                    }
                }
            }
            Ok(())
        }
        Command::Scan { flags } => {
            let symbols = resolve_symbols(&config, &exchange, flags.symbols.as_deref()).await?;
            let start = flags.start_date(&config)?;
            let (do_klines, do_metrics) = flags.targets();
            let backfiller = Backfiller::new(exchange, store);
            let mut candle_gaps: Vec<GapInfo> = Vec::new();
            let mut metrics_gaps: Vec<GapInfo> = Vec::new();
            for symbol in &symbols {
                if do_klines {
                    candle_gaps.extend(backfiller.scan_symbol(symbol, Interval::M1, start)?);
                }
                if do_metrics {
                    metrics_gaps.extend(backfiller.scan_symbol_metrics(symbol, start)?);
                }
            }
            let report = serde_json::json!({
                "symbols": symbols,
                "candle_gaps": candle_gaps.iter().map(gap_to_json).collect::<Vec<_>>(),
                "metrics_gaps": metrics_gaps.iter().map(gap_to_json).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            Ok(())
        }
        Command::Health => run_health_check(&config, &store, &exchange).await,
    }
}

fn gap_to_json(gap: &GapInfo) -> serde_json::Value {
    serde_json::json!({
        "symbol": gap.symbol,
        "date": gap.date.to_string(),
        "expected": gap.expected,
        "actual": gap.actual,
    })
}

async fn resolve_symbols(config: &Config, exchange: &ExchangeClient, explicit: Option<&str>) -> Result<Vec<String>> {
    if let Some(csv) = explicit {
        let list: Vec<String> = csv.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
        if !list.is_empty() {
            return Ok(list);
        }
    }
    symbols::resolve(
        exchange.http(),
        &config.symbols_groups,
        &config.symbols_exclude,
        &config.symbols_extra,
    )
    .await
}

/// Store + exchange reachability check, in the spirit of the original
/// `scripts/health_check.py`: a database round-trip and a `/fapi/v1/ping`, reported
/// as one JSON line.
async fn run_health_check(config: &Config, store: &Store, exchange: &ExchangeClient) -> Result<()> {
    let store_ok = store
        .coverage("BTCUSDT", "1m", chrono::Utc::now().date_naive())
        .is_ok();

    let ping_ok = exchange.get_fapi("/fapi/v1/ping", &[]).await.is_ok();

    let report = serde_json::json!({
        "database_url": config.database_url,
        "store_ok": store_ok,
        "exchange_reachable": ping_ok,
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());

    if store_ok && ping_ok {
        Ok(())
    } else {
        Err(DatacatError::external("health check failed"))
    }
}
