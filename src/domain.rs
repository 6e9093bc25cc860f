// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::book::OrderBook;

/// Newest-first trade history kept per market, bounded.
const MAX_TRADE_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Bitmex,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Binance => "binance",
            ExchangeKind::Bitmex => "bitmex",
        }
    }

    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Some(ExchangeKind::Binance),
            "bitmex" => Some(ExchangeKind::Bitmex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Ticker,
    Book,
    Trades,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Ticker => "ticker",
            StreamKind::Book => "book",
            StreamKind::Trades => "trades",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// Venue spellings: "BUY"/"SELL", "Buy"/"Sell".
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// Net position direction on derivative venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

/// `MarketClose` is a market order with close/reduce-only semantics where
/// the venue distinguishes that from a plain spot-style market order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Limit,
    Market,
    MarketClose,
}

/// Static + slow-moving per-symbol state refreshed over REST and patched by
/// the ticker stream.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub exchange: ExchangeKind,
    pub symbol: String,
    /// Traded asset (e.g. XBT in XBTUSD, BTC in BTCUSDT).
    pub market_currency: String,
    /// Quote asset the price is denominated in.
    pub base_currency: String,
    pub tick_size: f64,
    pub contract: bool,
    pub contract_value: f64,
    pub fee: f64,
    pub last: f64,
    pub hr24_high: f64,
    pub hr24_low: f64,
    pub volume: f64,
    pub change: f64,
    pub highest_bid: f64,
    pub lowest_ask: f64,
    pub updated: DateTime<Utc>,
}

impl Instrument {
    pub fn new(
        exchange: ExchangeKind,
        symbol: impl Into<String>,
        market_currency: impl Into<String>,
        base_currency: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            market_currency: market_currency.into(),
            base_currency: base_currency.into(),
            tick_size: 0.0,
            contract: false,
            contract_value: 1.0,
            fee: 0.0,
            last: 0.0,
            hr24_high: 0.0,
            hr24_low: 0.0,
            volume: 0.0,
            change: 0.0,
            highest_bid: 0.0,
            lowest_ask: 0.0,
            updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BalanceInfo {
    pub currency: String,
    pub balance: f64,
    pub available: f64,
    pub on_orders: f64,
}

#[derive(Debug, Clone)]
pub struct OpenedOrderInfo {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub amount: f64,
    pub total: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TradeInfoItem {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub amount: f64,
    pub ts: DateTime<Utc>,
}

/// Normalized acknowledgement of a trading call (place/cancel/status).
#[derive(Debug, Clone)]
pub struct TradingResult {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Option<PositionSide>,
    pub price: f64,
    pub amount: f64,
    pub total: f64,
    pub status: String,
    pub filled: bool,
    pub ts: DateTime<Utc>,
}

/// Best bid/ask move published on the tick bus.
#[derive(Debug, Clone)]
pub struct TickEvent {
    pub ts_ns: i128,
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
}

impl TickEvent {
    pub fn now(exchange: ExchangeKind, symbol: impl Into<String>, best_bid: f64, best_ask: f64) -> Self {
        Self {
            ts_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128,
            exchange,
            symbol: symbol.into(),
            best_bid,
            best_ask,
        }
    }
}

/// API credentials plus the account collections polled over REST.
///
/// Both collections are replaced wholesale under their lock: a freshly
/// parsed batch is swapped in, so concurrent readers see either the old or
/// the new list, never an emptied one.
#[derive(Debug)]
pub struct AccountInfo {
    pub exchange: ExchangeKind,
    pub api_key: String,
    pub api_secret: String,
    balances: Mutex<Vec<BalanceInfo>>,
    opened_orders: Mutex<Vec<OpenedOrderInfo>>,
}

impl AccountInfo {
    pub fn new(exchange: ExchangeKind, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            exchange,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            balances: Mutex::new(Vec::new()),
            opened_orders: Mutex::new(Vec::new()),
        }
    }

    pub fn replace_balances(&self, next: Vec<BalanceInfo>) {
        let mut guard = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }

    pub fn balances(&self) -> Vec<BalanceInfo> {
        self.balances.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn balance_of(&self, currency: &str) -> Option<BalanceInfo> {
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|b| b.currency.eq_ignore_ascii_case(currency))
            .cloned()
    }

    pub fn replace_opened_orders(&self, next: Vec<OpenedOrderInfo>) {
        let mut guard = self.opened_orders.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }

    pub fn opened_orders(&self) -> Vec<OpenedOrderInfo> {
        self.opened_orders.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Everything live for one tradeable symbol: instrument state, the order
/// book mirror and a bounded newest-first trade tape.
#[derive(Debug)]
pub struct Market {
    instrument: RwLock<Instrument>,
    pub book: OrderBook,
    trades: Mutex<Vec<TradeInfoItem>>,
    /// Sequence of the last applied book diff, for feeds that number them.
    pub last_seq: AtomicU64,
}

impl Market {
    pub fn new(instrument: Instrument) -> Self {
        let book = if instrument.contract {
            OrderBook::with_inverted_asks()
        } else {
            OrderBook::new()
        };
        Self {
            instrument: RwLock::new(instrument),
            book,
            trades: Mutex::new(Vec::new()),
            last_seq: AtomicU64::new(0),
        }
    }

    pub fn instrument(&self) -> Instrument {
        self.instrument.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn update_instrument(&self, patch: impl FnOnce(&mut Instrument)) {
        let mut guard = self.instrument.write().unwrap_or_else(PoisonError::into_inner);
        patch(&mut guard);
    }

    /// Prepend freshly received trades (newest first), bounded.
    pub fn prepend_trades(&self, items: Vec<TradeInfoItem>) {
        if items.is_empty() {
            return;
        }
        let mut guard = self.trades.lock().unwrap_or_else(PoisonError::into_inner);
        let mut merged = items;
        merged.extend(guard.drain(..));
        merged.truncate(MAX_TRADE_HISTORY);
        *guard = merged;
    }

    pub fn trades(&self) -> Vec<TradeInfoItem> {
        self.trades.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Symbol -> market, built once at startup and shared read-only after.
pub type MarketTable = ahash::AHashMap<String, Arc<Market>>;
