// =============================================================================
// Regime Desk: Main Entry Point
// =============================================================================
//
// `REGIME_DESK_MODE=live` (default) reads JSON-lines feed events from stdin and
// steps every configured symbol on an interval. `REGIME_DESK_MODE=backtest`
// replays CSV bars + JSON-lines signals for one or more symbols. Both modes
// seed their risk book from `REGIME_DESK_RISK` when it is set.
// =============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use regime_desk::backtest::BacktestHarness;
use regime_desk::live::LiveRunner;
use regime_desk::market_data::feed::{load_bars_csv, load_signals_jsonl};
use regime_desk::market_data::ingest::run_ingest;
use regime_desk::market_data::{BarBuffer, BarKey, HistoricalFeed, LiveFeed, SignalBoard};
use regime_desk::risk::{load_risk_snapshot, RiskSnapshot};
use regime_desk::{ConfigHandle, EngineConfig, ReplayMode, StepOutcome};

const DEFAULT_CONFIG: &str = "regime_desk.json";
const BAR_BUFFER_CAPACITY: usize = 2_000;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Base risk snapshot named by `REGIME_DESK_RISK`, or the neutral default.
fn base_risk() -> Result<RiskSnapshot> {
    match std::env::var("REGIME_DESK_RISK") {
        Ok(path) => load_risk_snapshot(&path),
        Err(_) => Ok(RiskSnapshot::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = PathBuf::from(env_or("REGIME_DESK_CONFIG", DEFAULT_CONFIG));
    let mode = env_or("REGIME_DESK_MODE", "live").to_ascii_lowercase();

    info!(mode = %mode, config = %config_path.display(), "regime desk starting");

    let risk = base_risk()?;

    match mode.as_str() {
        "live" => run_live(config_path, risk).await,
        "backtest" => run_backtest(config_path, risk),
        other => bail!("unknown REGIME_DESK_MODE '{other}' (expected live|backtest)"),
    }
}

// ---------------------------------------------------------------------------
// Live
// ---------------------------------------------------------------------------

async fn run_live(config_path: PathBuf, risk: RiskSnapshot) -> Result<()> {
    let handle = Arc::new(ConfigHandle::from_path(config_path));

    // Symbols from env override the file.
    if let Ok(syms) = std::env::var("REGIME_DESK_SYMBOL") {
        let mut cfg = (*handle.snapshot()).clone();
        cfg.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        handle.replace(cfg);
    }

    let cfg = handle.snapshot();
    if cfg.symbols.is_empty() {
        bail!("no symbols configured; set REGIME_DESK_SYMBOL or `symbols` in the config");
    }
    info!(symbols = ?cfg.symbols, timeframe = %cfg.timeframe, "configured symbols");

    let bars = Arc::new(BarBuffer::new(BAR_BUFFER_CAPACITY.max(cfg.data.window_bars)));
    let board = Arc::new(SignalBoard::new());
    let feed = LiveFeed::new(bars.clone(), board.clone());

    let trade_log = std::env::var("REGIME_DESK_LIVE_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| cfg.live.trade_log.clone());
    let mut runner = LiveRunner::new(handle.clone(), feed, &trade_log, risk)?;
    info!(trade_log = %trade_log.display(), "live trade log opened");

    // ── Feed ingest from stdin ───────────────────────────────────────────
    tokio::spawn(async move {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(e) = run_ingest(reader, bars, board).await {
            error!(error = %e, "feed ingest stopped");
        }
    });

    // ── Step loop + config reload ────────────────────────────────────────
    let mut tick =
        tokio::time::interval(tokio::time::Duration::from_millis(cfg.live.poll_interval_ms.max(10)));
    let mut reload = tokio::time::interval(tokio::time::Duration::from_secs(
        cfg.live.config_reload_secs.max(1),
    ));

    info!("live loop running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = chrono::Utc::now().timestamp_millis();
                for (symbol, outcome) in runner.tick(now) {
                    if let StepOutcome::Ok(report) = &outcome {
                        if let Some(open) = &report.opened {
                            info!(symbol = %symbol, trade_id = %open.trade_id, "position opened");
                        }
                        if let Some(close) = &report.closed {
                            info!(symbol = %symbol, trade_id = %close.trade_id, pct = ?close.pct, "position closed");
                        }
                    }
                }
            }
            _ = reload.tick() => {
                if let Err(e) = handle.reload() {
                    warn!(error = %e, "config reload failed; keeping current config");
                }
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                warn!("shutdown signal received, stopping");
                break;
            }
        }
    }

    let stats = runner.risk().stats();
    info!(
        trades = stats.material_trades(),
        pf = stats.profit_factor(),
        "regime desk shut down"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Backtest
// ---------------------------------------------------------------------------

/// Expand `{symbol}` in a path template.
fn path_for(template: &str, symbol: &str) -> PathBuf {
    PathBuf::from(template.replace("{symbol}", symbol))
}

fn run_backtest(config_path: PathBuf, risk: RiskSnapshot) -> Result<()> {
    let config = Arc::new(EngineConfig::load_or_default(&config_path));
    let replay: ReplayMode = env_or("REGIME_DESK_REPLAY", "standard")
        .parse()
        .map_err(anyhow::Error::msg)?;
    let out_dir = PathBuf::from(env_or("REGIME_DESK_OUT", "runs"));
    let bars_tpl = std::env::var("REGIME_DESK_BARS").context("REGIME_DESK_BARS is required for backtests")?;
    let signals_tpl =
        std::env::var("REGIME_DESK_SIGNALS").context("REGIME_DESK_SIGNALS is required for backtests")?;

    let symbols: Vec<String> = match std::env::var("REGIME_DESK_SYMBOL") {
        Ok(s) => s
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => config.symbols.clone(),
    };
    if symbols.is_empty() {
        bail!("no symbols to replay");
    }

    let mut feeds = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let bars = load_bars_csv(path_for(&bars_tpl, symbol))?;
        let signals = load_signals_jsonl(path_for(&signals_tpl, symbol))?;
        info!(symbol = %symbol, bars = bars.len(), signals = signals.len(), "history loaded");
        feeds.push(HistoricalFeed::new(
            BarKey::new(symbol.clone(), config.timeframe.clone()),
            bars,
            signals,
        ));
    }

    let harness = BacktestHarness::new(config, replay, out_dir).with_base_risk(risk);
    let mut failed = BTreeMap::new();
    for (key, result) in harness.run_many(&feeds) {
        match result {
            Ok(report) => info!(
                symbol = %key.symbol,
                run_dir = %report.run_dir.display(),
                closes = report.manifest.closes,
                final_equity = report.manifest.final_equity,
                "run finished"
            ),
            Err(e) => {
                error!(symbol = %key.symbol, error = %e, "run failed");
                failed.insert(key.symbol, e.to_string());
            }
        }
    }

    if !failed.is_empty() {
        bail!("{} of {} backtest runs failed: {:?}", failed.len(), feeds.len(), failed);
    }
    Ok(())
}
