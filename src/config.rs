// ===============================
// src/config.rs
// ===============================
//
// Env/.env configuration plus a small CLI. Everything operational comes
// from the environment (teacher-style `VAR`.parse chains with defaults);
// the CLI only selects run vs replay and carries a couple of overrides.

use clap::Parser;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::domain::ExchangeKind;
use crate::trailing::{TrailingKind, TrailingMode};

#[derive(Parser, Debug)]
#[command(name = "trail_bot_rust", about = "exchange connectivity + trailing stop engine")]
pub struct Cli {
    /// Replay a capture file through the live dispatch path, print the
    /// summary and exit (no network).
    #[arg(long, value_name = "FILE")]
    pub replay: Option<String>,

    /// Record every inbound stream message to this JSONL file
    /// (overrides CAPTURE_FILE).
    #[arg(long, value_name = "FILE")]
    pub capture: Option<String>,

    /// Overrides METRICS_PORT.
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct Endpoints {
    pub rest: String,
    pub ws: String,
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Fixed requests-per-interval rate policy, used when the exchange does not
/// advertise its budget in response headers.
#[derive(Clone, Copy, Debug)]
pub struct RatePolicy {
    pub interval: Duration,
    pub limit: u32,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub exchanges: Vec<ExchangeKind>,
    pub binance_symbols: Vec<String>,
    pub bitmex_symbols: Vec<String>,

    pub binance: Endpoints,
    pub bitmex: Endpoints,
    pub binance_rate: RatePolicy,
    pub bitmex_rate: RatePolicy,

    /// Binance `recvWindow` for signed calls, milliseconds.
    pub recv_window_ms: u64,
    /// Bitmex `api-expires` lead, seconds.
    pub expires_lead_secs: u64,

    pub capture_file: Option<String>,
    pub replay_file: Option<String>,
    pub metrics_port: u16,

    pub snapshot_depth: u32,
    pub ticker_poll_secs: u64,
    pub account_poll_secs: u64,
}

impl Args {
    pub fn symbols_for(&self, kind: ExchangeKind) -> &[String] {
        match kind {
            ExchangeKind::Binance => &self.binance_symbols,
            ExchangeKind::Bitmex => &self.bitmex_symbols,
        }
    }
}

/// One configured trailing order (the strategy is per-instrument).
#[derive(Clone, Debug)]
pub struct TrailingConfig {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub kind: TrailingKind,
    pub mode: TrailingMode,
    pub buy_price: f64,
    pub amount: f64,
    pub stop_loss_percent: f64,
    pub take_profit_start_percent: f64,
    pub take_profit_percent: f64,
    pub ignore_stop_loss: bool,
    pub incremental_stop_loss: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

pub fn credentials_for(kind: ExchangeKind) -> Option<Credentials> {
    let (key_var, secret_var) = match kind {
        ExchangeKind::Binance => ("BINANCE_API_KEY", "BINANCE_API_SECRET"),
        ExchangeKind::Bitmex => ("BITMEX_API_KEY", "BITMEX_API_SECRET"),
    };
    let api_key = env::var(key_var).ok().filter(|s| !s.is_empty())?;
    let api_secret = env::var(secret_var).ok().filter(|s| !s.is_empty())?;
    Some(Credentials { api_key, api_secret })
}

fn load_trailing() -> Option<TrailingConfig> {
    let symbol = env::var("TRAILING_SYMBOL")
        .ok()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())?;
    let exchange = env::var("TRAILING_EXCHANGE")
        .ok()
        .and_then(|s| ExchangeKind::parse_one(&s))
        .unwrap_or(ExchangeKind::Binance);
    let buy_price: f64 = env_parse("TRAILING_BUY_PRICE", 0.0);
    let amount: f64 = env_parse("TRAILING_AMOUNT", 0.0);
    if !(buy_price > 0.0 && amount > 0.0) {
        tracing::warn!(
            %symbol,
            "TRAILING_SYMBOL set but TRAILING_BUY_PRICE/TRAILING_AMOUNT missing, trailing disabled"
        );
        return None;
    }
    Some(TrailingConfig {
        exchange,
        symbol,
        kind: env::var("TRAILING_KIND")
            .ok()
            .and_then(|s| TrailingKind::parse_one(&s))
            .unwrap_or(TrailingKind::Sell),
        mode: env::var("TRAILING_MODE")
            .ok()
            .and_then(|s| TrailingMode::parse_one(&s))
            .unwrap_or(TrailingMode::Execute),
        buy_price,
        amount,
        stop_loss_percent: env_parse("TRAILING_STOP_LOSS_PCT", 10.0),
        take_profit_start_percent: env_parse("TRAILING_TAKE_PROFIT_START_PCT", 20.0),
        take_profit_percent: env_parse("TRAILING_TAKE_PROFIT_PCT", 5.0),
        ignore_stop_loss: env_bool("TRAILING_IGNORE_STOP_LOSS"),
        incremental_stop_loss: env_bool("TRAILING_INCREMENTAL_STOP_LOSS"),
    })
}

pub fn load() -> (Args, Option<TrailingConfig>) {
    let _ = dotenv();
    let cli = Cli::parse();

    // EXCHANGES=binance,bitmex
    let exchanges: Vec<ExchangeKind> = env::var("EXCHANGES")
        .unwrap_or_else(|_| "binance".to_string())
        .split(',')
        .filter_map(ExchangeKind::parse_one)
        .collect();

    let binance = Endpoints {
        rest: env::var("BINANCE_REST_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string()),
        ws: env::var("BINANCE_WS_URL")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443/ws".to_string()),
    };
    let bitmex = Endpoints {
        rest: env::var("BITMEX_REST_URL")
            .unwrap_or_else(|_| "https://www.bitmex.com".to_string()),
        ws: env::var("BITMEX_WS_URL")
            .unwrap_or_else(|_| "wss://ws.bitmex.com/realtime".to_string()),
    };

    let args = Args {
        exchanges,
        binance_symbols: env_list("BINANCE_SYMBOLS", &["BTCUSDT"]),
        bitmex_symbols: env_list("BITMEX_SYMBOLS", &["XBTUSD"]),
        binance,
        bitmex,
        // Binance budget is weight-based; 1200/min is the documented ceiling
        binance_rate: RatePolicy {
            interval: Duration::from_secs(60),
            limit: env_parse("BINANCE_RATE_LIMIT", 1200),
        },
        // Bitmex advertises its budget in headers; 60/min is the fallback
        bitmex_rate: RatePolicy {
            interval: Duration::from_secs(60),
            limit: env_parse("BITMEX_RATE_LIMIT", 60),
        },
        recv_window_ms: env_parse("BINANCE_RECV_WINDOW_MS", 5_000),
        expires_lead_secs: env_parse("BITMEX_EXPIRES_LEAD_SECS", 60),
        capture_file: cli.capture.or_else(|| env::var("CAPTURE_FILE").ok()),
        replay_file: cli.replay,
        metrics_port: cli.metrics_port.unwrap_or_else(|| env_parse("METRICS_PORT", 9898)),
        snapshot_depth: env_parse("SNAPSHOT_DEPTH", 100),
        ticker_poll_secs: env_parse("TICKER_POLL_SECS", 10),
        account_poll_secs: env_parse("ACCOUNT_POLL_SECS", 30),
    };

    (args, load_trailing())
}
