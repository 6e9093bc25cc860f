// ===============================
// src/main.rs
// ===============================
mod book;
mod capture;
mod config;
mod domain;
mod error;
mod exchange;
mod exchange_binance;
mod exchange_bitmex;
mod gateway;
mod metrics;
mod ratelimit;
mod sign;
mod stream;
mod trailing;

use ahash::AHashMap;
use std::sync::Arc;
use tokio::{
    select,
    sync::{broadcast, mpsc},
    time::{interval, sleep, Duration},
};
use tracing::{error, info, warn};

use crate::capture::CaptureSink;
use crate::config::{Args, TrailingConfig};
use crate::domain::{AccountInfo, ExchangeKind, Instrument, Market, MarketTable, StreamKind, TickEvent};
use crate::exchange::{ExchangeApi, ExchangeRegistry, RestClient};
use crate::exchange_binance::BinanceExchange;
use crate::exchange_bitmex::BitmexExchange;
use crate::gateway::TradingGateway;
use crate::ratelimit::RateLimiter;
use crate::stream::{ResyncRequest, StreamConnection};
use crate::trailing::{LogNotifier, TrailingDriver, TrailingMode, TrailingSettings};

fn build_registry(args: &Args) -> ExchangeRegistry {
    let mut registry = ExchangeRegistry::new();
    for kind in &args.exchanges {
        let api: Arc<dyn ExchangeApi> = match kind {
            ExchangeKind::Binance => {
                let limiter = RateLimiter::new(
                    ExchangeKind::Binance,
                    args.binance_rate.interval,
                    args.binance_rate.limit,
                );
                Arc::new(BinanceExchange::new(
                    RestClient::new(ExchangeKind::Binance, limiter),
                    &args.binance.rest,
                    &args.binance.ws,
                    args.recv_window_ms,
                ))
            }
            ExchangeKind::Bitmex => {
                let limiter = RateLimiter::new(
                    ExchangeKind::Bitmex,
                    args.bitmex_rate.interval,
                    args.bitmex_rate.limit,
                );
                Arc::new(BitmexExchange::new(
                    RestClient::new(ExchangeKind::Bitmex, limiter),
                    &args.bitmex.rest,
                    &args.bitmex.ws,
                    args.expires_lead_secs,
                ))
            }
        };
        registry.insert(api);
    }
    registry
}

/// Market with nothing but the symbol filled in; REST refresh and the
/// streams populate the rest.
fn bare_market(kind: ExchangeKind, symbol: &str) -> Arc<Market> {
    let mut inst = Instrument::new(kind, symbol, "", "");
    inst.contract = kind == ExchangeKind::Bitmex;
    Arc::new(Market::new(inst))
}

/// Instrument-list load with a few retries on transient failure. Falls back
/// to bare markets so streams still come up when the venue is flaky at boot.
async fn build_markets(api: &dyn ExchangeApi, symbols: &[String]) -> MarketTable {
    let kind = api.kind();
    let mut table = MarketTable::default();

    for attempt in 1..=3u32 {
        match api.load_instruments().await {
            Ok(instruments) => {
                for symbol in symbols {
                    match instruments.iter().find(|i| &i.symbol == symbol) {
                        Some(inst) => {
                            table.insert(symbol.clone(), Arc::new(Market::new(inst.clone())));
                        }
                        None => {
                            warn!(
                                exchange = kind.as_str(),
                                %symbol,
                                "symbol not in instrument list, starting bare"
                            );
                            table.insert(symbol.clone(), bare_market(kind, symbol));
                        }
                    }
                }
                return table;
            }
            Err(e) if e.is_transient() && attempt < 3 => {
                warn!(exchange = kind.as_str(), %e, attempt, "instrument load failed, retrying");
                sleep(Duration::from_secs(5)).await;
            }
            Err(e) => {
                error!(exchange = kind.as_str(), %e, "instrument load failed, starting bare");
                break;
            }
        }
    }
    for symbol in symbols {
        table.insert(symbol.clone(), bare_market(kind, symbol));
    }
    table
}

async fn run_replay(path: &str, args: &Args, registry: &ExchangeRegistry) {
    let mut markets: AHashMap<ExchangeKind, Arc<MarketTable>> = AHashMap::new();
    for kind in registry.kinds() {
        let mut table = MarketTable::default();
        for symbol in args.symbols_for(kind) {
            table.insert(symbol.clone(), bare_market(kind, symbol));
        }
        markets.insert(kind, Arc::new(table));
    }

    match capture::replay_file(path, registry, &markets).await {
        Ok(summary) => {
            info!(
                events = summary.events,
                applied = summary.applied,
                ticks = summary.ticks,
                trades = summary.trades,
                resyncs = summary.resyncs,
                skipped = summary.skipped,
                errors = summary.errors,
                "replay finished"
            );
            for (kind, table) in &markets {
                for (symbol, market) in table.iter() {
                    let (bid, ask) = market.book.best_pair();
                    info!(
                        exchange = kind.as_str(),
                        %symbol,
                        best_bid = bid.map(|e| e.price),
                        best_ask = ask.map(|e| e.price),
                        depth = ?market.book.depth(),
                        dirty = market.book.is_dirty(),
                        trades = market.trades().len(),
                        "replayed book"
                    );
                }
            }
        }
        Err(e) => error!(%path, ?e, "replay failed"),
    }
}

fn spawn_streams(
    api: Arc<dyn ExchangeApi>,
    table: Arc<MarketTable>,
    tick_tx: &broadcast::Sender<TickEvent>,
    resync_tx: &mpsc::Sender<ResyncRequest>,
    capture: &Option<CaptureSink>,
    snapshot_depth: u32,
) {
    let kind = api.kind();
    let spawn_one = |stream_kind: StreamKind, instrument: Instrument| {
        let conn = StreamConnection::new(
            api.clone(),
            stream_kind,
            instrument,
            table.clone(),
            tick_tx.clone(),
            resync_tx.clone(),
            capture.clone(),
        );
        tokio::spawn(conn.run());
    };

    // ticker feed: Bitmex is venue-wide (one socket covers every symbol),
    // Binance bookTicker is a per-symbol stream path
    match kind {
        ExchangeKind::Bitmex => {
            if let Some(market) = table.values().next() {
                spawn_one(StreamKind::Ticker, market.instrument());
            }
        }
        ExchangeKind::Binance => {
            for market in table.values() {
                spawn_one(StreamKind::Ticker, market.instrument());
            }
        }
    }

    for market in table.values() {
        let instrument = market.instrument();
        spawn_one(StreamKind::Book, instrument.clone());
        spawn_one(StreamKind::Trades, instrument);

        // initial snapshot; later resyncs go through the resync task
        let api = api.clone();
        let market = market.clone();
        tokio::spawn(async move {
            if let Err(e) = api.book_snapshot(&market, snapshot_depth).await {
                warn!(
                    exchange = api.kind().as_str(),
                    symbol = %market.instrument().symbol,
                    %e,
                    "initial book snapshot failed"
                );
            }
        });
    }
}

fn spawn_trailing(
    cfg: TrailingConfig,
    registry: &ExchangeRegistry,
    markets: &AHashMap<ExchangeKind, Arc<MarketTable>>,
    accounts: &AHashMap<ExchangeKind, Arc<AccountInfo>>,
    tick_tx: &broadcast::Sender<TickEvent>,
) {
    let Some(api) = registry.get(cfg.exchange) else {
        error!(exchange = cfg.exchange.as_str(), "trailing exchange not configured");
        return;
    };
    let Some(market) = markets.get(&cfg.exchange).and_then(|t| t.get(&cfg.symbol)) else {
        error!(
            exchange = cfg.exchange.as_str(),
            symbol = %cfg.symbol,
            "trailing symbol not configured"
        );
        return;
    };

    let mut mode = cfg.mode;
    let account = match accounts.get(&cfg.exchange) {
        Some(acct) => acct.clone(),
        None => {
            if mode == TrailingMode::Execute {
                warn!(
                    exchange = cfg.exchange.as_str(),
                    "no credentials for trailing execute mode, demoting to notify"
                );
                mode = TrailingMode::Notify;
            }
            Arc::new(AccountInfo::new(cfg.exchange, "", ""))
        }
    };

    let mut settings = TrailingSettings::new(
        cfg.exchange,
        cfg.symbol.clone(),
        cfg.kind,
        mode,
        cfg.buy_price,
        cfg.amount,
    );
    settings.stop_loss_percent = cfg.stop_loss_percent;
    settings.take_profit_start_percent = cfg.take_profit_start_percent;
    settings.take_profit_percent = cfg.take_profit_percent;
    settings.ignore_stop_loss = cfg.ignore_stop_loss;
    settings.incremental_stop_loss = cfg.incremental_stop_loss;

    metrics::CONFIG_TRAILING
        .with_label_values(&[cfg.exchange.as_str(), &cfg.symbol, mode.as_str()])
        .set(1);

    let driver = TrailingDriver::new(
        settings,
        market.instrument(),
        TradingGateway::new(api, account),
        Arc::new(LogNotifier),
    );
    tokio::spawn(driver.run(tick_tx.subscribe()));
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    // ---- Config ----
    let (args, trailing_cfg) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        exchanges = ?args.exchanges.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
        binance_symbols = ?args.binance_symbols,
        bitmex_symbols = ?args.bitmex_symbols,
        capture = ?args.capture_file,
        replay = ?args.replay_file,
        metrics_port = args.metrics_port,
        "startup config"
    );
    for kind in &args.exchanges {
        metrics::CONFIG_EXCHANGE.with_label_values(&[kind.as_str()]).set(1);
        for symbol in args.symbols_for(*kind) {
            metrics::CONFIG_SYMBOL
                .with_label_values(&[kind.as_str(), symbol])
                .set(1);
        }
    }

    // ---- Exchange connectors (explicit construction, no globals) ----
    let registry = Arc::new(build_registry(&args));
    if registry.is_empty() {
        error!("no exchange configured, nothing to do");
        return;
    }

    // ---- Replay mode: same dispatch path, no network ----
    if let Some(path) = args.replay_file.clone() {
        run_replay(&path, &args, &registry).await;
        return;
    }

    // ---- Capture (optional) ----
    let capture = args.capture_file.clone().map(|path| {
        let (tx, rx) = mpsc::channel(8192);
        tokio::spawn(capture::run_recorder(rx, path));
        CaptureSink::new(tx)
    });

    // ---- Buses ----
    let (tick_tx, _tick_rx) = broadcast::channel::<TickEvent>(4096);
    let (resync_tx, mut resync_rx) = mpsc::channel::<ResyncRequest>(256);

    // ---- Markets, accounts, streams, pollers per exchange ----
    let mut markets: AHashMap<ExchangeKind, Arc<MarketTable>> = AHashMap::new();
    let mut accounts: AHashMap<ExchangeKind, Arc<AccountInfo>> = AHashMap::new();

    for kind in registry.kinds() {
        let api = match registry.get(kind) {
            Some(api) => api,
            None => continue,
        };
        let table = Arc::new(build_markets(api.as_ref(), args.symbols_for(kind)).await);
        markets.insert(kind, table.clone());

        spawn_streams(
            api.clone(),
            table.clone(),
            &tick_tx,
            &resync_tx,
            &capture,
            args.snapshot_depth,
        );

        // ticker refresh poller (the connector self-throttles)
        {
            let api = api.clone();
            let table = table.clone();
            let mut tick = interval(Duration::from_secs(args.ticker_poll_secs.max(1)));
            tokio::spawn(async move {
                loop {
                    tick.tick().await;
                    if let Err(e) = api.refresh_instruments(&table).await {
                        warn!(exchange = api.kind().as_str(), %e, "ticker refresh failed");
                    }
                }
            });
        }

        // account poller, only with credentials
        if let Some(creds) = config::credentials_for(kind) {
            let account = Arc::new(AccountInfo::new(kind, creds.api_key, creds.api_secret));
            accounts.insert(kind, account.clone());

            let api = api.clone();
            let mut tick = interval(Duration::from_secs(args.account_poll_secs.max(1)));
            tokio::spawn(async move {
                loop {
                    tick.tick().await;
                    if let Err(e) = api.update_balances(&account).await {
                        warn!(exchange = api.kind().as_str(), %e, "balance poll failed");
                    }
                    if let Err(e) = api.update_opened_orders(&account, None).await {
                        warn!(exchange = api.kind().as_str(), %e, "open orders poll failed");
                    }
                }
            });
        } else {
            info!(exchange = kind.as_str(), "no credentials, market data only");
        }
    }

    // ---- Book resync task: dirty books get a fresh REST snapshot ----
    {
        let registry_markets = markets.clone();
        let registry = registry.clone();
        let depth = args.snapshot_depth;
        tokio::spawn(async move {
            while let Some(req) = resync_rx.recv().await {
                let (Some(api), Some(market)) = (
                    registry.get(req.exchange),
                    registry_markets.get(&req.exchange).and_then(|t| t.get(&req.symbol)),
                ) else {
                    continue;
                };
                if let Err(e) = api.book_snapshot(market, depth).await {
                    // book stays dirty; the next gapped diff re-requests
                    warn!(
                        exchange = req.exchange.as_str(),
                        symbol = %req.symbol,
                        %e,
                        "book resync failed"
                    );
                }
            }
        });
    }

    // ---- Trailing strategy (optional) ----
    if let Some(cfg) = trailing_cfg {
        spawn_trailing(cfg, &registry, &markets, &accounts, &tick_tx);
    }

    // ---- Heartbeat ----
    let mut tick_rx = tick_tx.subscribe();
    let mut tick_count: u64 = 0;
    loop {
        select! {
            Ok(_tick) = tick_rx.recv() => {
                tick_count += 1;
            },
            _ = sleep(Duration::from_secs(1)) => {
                info!(ticks = tick_count, "heartbeat");
                tick_count = 0;
            }
        }
    }
}
