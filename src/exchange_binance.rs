// ===============================
// src/exchange_binance.rs
// ===============================
//
// Binance spot connector.
//
// REST under /api/v3 (time, exchangeInfo, ticker/24hr, depth, aggTrades,
// account, openOrders, order); signed endpoints use query-string signing
// with the key in `X-MBX-APIKEY`.
//
// Streams: `<base>/<symbol>@bookTicker` for the ticker; depth diffs and
// trades ride a bare `/ws` socket with a SUBSCRIBE frame. The depth feed
// is price-keyed: the synthetic entry id is the price's bit pattern, a
// zero quantity removes the level, and `U`/`u` sequence numbers gate gaps.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::debug;

use crate::book::{BookOp, BookSide, BookUpdate};
use crate::domain::{
    AccountInfo, BalanceInfo, ExchangeKind, Instrument, Market, MarketTable, OpenedOrderInfo,
    OrderKind, OrderSide, StreamKind, TradeInfoItem, TradingResult,
};
use crate::error::ApiError;
use crate::exchange::{
    bad_json, parse_error_body, require_f64, value_f64, DispatchOutcome, ExchangeApi, RestClient,
    ThrottleGate, TickUpdate,
};
use crate::sign::{encode_query, sign_query, timestamp_ms};

/// Minimum gap between full ticker refetches.
const TICKER_REFRESH_GAP: Duration = Duration::from_secs(5);

/// Synthetic book entry id for a price-keyed feed.
fn price_id(price: f64) -> u64 {
    price.to_bits()
}

pub struct BinanceExchange {
    rest: RestClient,
    rest_base: String,
    ws_base: String,
    recv_window: u64,
    refresh_gate: ThrottleGate,
}

impl BinanceExchange {
    pub fn new(rest: RestClient, rest_base: &str, ws_base: &str, recv_window: u64) -> Self {
        Self {
            rest,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            ws_base: ws_base.trim_end_matches('/').to_string(),
            recv_window,
            refresh_gate: ThrottleGate::new(TICKER_REFRESH_GAP),
        }
    }

    fn signed_url(
        &self,
        account: &AccountInfo,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String, ApiError> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("timestamp", timestamp_ms().to_string()));
        all.push(("recvWindow", self.recv_window.to_string()));
        let query = encode_query(&all);
        let signature = sign_query(&account.api_secret, &query)?;
        Ok(format!("{}{}?{}&signature={}", self.rest_base, path, query, signature))
    }

    /// Normalize an order-endpoint response. Exchange error objects can
    /// arrive with a 200, so they are checked before the happy path.
    fn parse_trade_result(
        &self,
        body: &str,
        side: OrderSide,
        fallback_price: f64,
        fallback_amount: f64,
    ) -> Result<TradingResult, ApiError> {
        if let Some(err) = parse_error_body(body) {
            return Err(err);
        }
        let v: serde_json::Value = serde_json::from_str(body).map_err(bad_json)?;

        let order_id = v
            .get("orderId")
            .map(|id| id.to_string())
            .ok_or_else(|| ApiError::protocol("order response missing orderId"))?;
        let symbol = v.get("symbol").and_then(|s| s.as_str()).unwrap_or_default().to_string();
        let status = v
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("NEW")
            .to_string();
        let side = v
            .get("side")
            .and_then(|s| s.as_str())
            .and_then(OrderSide::parse)
            .unwrap_or(side);
        let amount = v
            .get("origQty")
            .and_then(value_f64)
            .filter(|q| *q > 0.0)
            .unwrap_or(fallback_amount);

        // market orders report price 0; the fills carry the real levels
        let mut price = v.get("price").and_then(value_f64).unwrap_or(0.0);
        if price <= 0.0 {
            price = fill_avg_price(&v).unwrap_or(fallback_price);
        }

        let ts = v
            .get("transactTime")
            .or_else(|| v.get("time"))
            .and_then(|t| t.as_i64())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(TradingResult {
            order_id,
            symbol,
            side,
            position_side: None,
            price,
            amount,
            total: price * amount,
            status: status.clone(),
            filled: status == "FILLED",
            ts,
        })
    }

    fn apply_book_ticker(
        &self,
        markets: &MarketTable,
        v: &serde_json::Value,
    ) -> Result<DispatchOutcome, ApiError> {
        let Some(symbol) = v.get("s").and_then(|s| s.as_str()) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let Some(market) = markets.get(symbol) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let bid = v
            .get("b")
            .and_then(value_f64)
            .ok_or_else(|| ApiError::protocol("bookTicker missing bid"))?;
        let ask = v
            .get("a")
            .and_then(value_f64)
            .ok_or_else(|| ApiError::protocol("bookTicker missing ask"))?;
        if bid <= 0.0 || ask <= 0.0 {
            return Ok(DispatchOutcome::Ignored);
        }
        market.update_instrument(|inst| {
            inst.highest_bid = bid;
            inst.lowest_ask = ask;
            inst.updated = Utc::now();
        });
        Ok(DispatchOutcome::Tickers(vec![TickUpdate {
            symbol: symbol.to_string(),
            best_bid: bid,
            best_ask: ask,
        }]))
    }

    fn apply_depth(
        &self,
        markets: &MarketTable,
        v: serde_json::Value,
    ) -> Result<DispatchOutcome, ApiError> {
        let upd: DepthUpdate = serde_json::from_value(v).map_err(bad_json)?;
        let Some(market) = markets.get(&upd.symbol) else {
            return Ok(DispatchOutcome::Ignored);
        };

        let last = market.last_seq.load(Ordering::Acquire);
        if last != 0 && upd.final_update_id <= last {
            // overlap with the snapshot we already hold
            return Ok(DispatchOutcome::Ignored);
        }
        if last != 0 && upd.first_update_id > last + 1 {
            debug!(
                symbol = %upd.symbol,
                have = last,
                got = upd.first_update_id,
                "depth sequence gap"
            );
            market.book.mark_dirty();
            return Ok(DispatchOutcome::BookNeedsResync { symbol: upd.symbol });
        }

        {
            let mut u = market.book.update();
            for level in &upd.bids {
                apply_price_level(&mut u, BookSide::Bid, level)?;
            }
            for level in &upd.asks {
                apply_price_level(&mut u, BookSide::Ask, level)?;
            }
        }
        market.last_seq.store(upd.final_update_id, Ordering::Release);

        let (bid, ask) = market.book.best_pair();
        Ok(DispatchOutcome::BookApplied {
            symbol: upd.symbol,
            best_bid: bid.map(|e| e.price),
            best_ask: ask.map(|e| e.price),
        })
    }

    fn apply_trade(
        &self,
        markets: &MarketTable,
        v: &serde_json::Value,
    ) -> Result<DispatchOutcome, ApiError> {
        let Some(symbol) = v.get("s").and_then(|s| s.as_str()) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let Some(market) = markets.get(symbol) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let price = v
            .get("p")
            .and_then(value_f64)
            .ok_or_else(|| ApiError::protocol("trade missing price"))?;
        let amount = v
            .get("q")
            .and_then(value_f64)
            .ok_or_else(|| ApiError::protocol("trade missing quantity"))?;
        // m == true: buyer was the maker, so the aggressor sold
        let side = if v.get("m").and_then(|m| m.as_bool()).unwrap_or(false) {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let ts = v
            .get("T")
            .and_then(|t| t.as_i64())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let id = v
            .get("t")
            .map(|t| t.to_string())
            .unwrap_or_else(|| ts.timestamp_millis().to_string());

        market.prepend_trades(vec![TradeInfoItem {
            id,
            symbol: symbol.to_string(),
            side,
            price,
            amount,
            ts,
        }]);
        Ok(DispatchOutcome::Trades { symbol: symbol.to_string(), appended: 1 })
    }
}

/// One price level of a depth diff: qty 0 removes, known id modifies,
/// otherwise adds. Removing a level we never held (below our snapshot
/// depth) is a no-op, not a desync.
fn apply_price_level(
    u: &mut BookUpdate<'_>,
    side: BookSide,
    level: &[String; 2],
) -> Result<(), ApiError> {
    let price: f64 = level[0]
        .parse()
        .ok()
        .filter(|p: &f64| p.is_finite())
        .ok_or_else(|| ApiError::protocol(format!("bad depth price {:?}", level[0])))?;
    let qty: f64 = level[1]
        .parse()
        .ok()
        .filter(|q: &f64| q.is_finite())
        .ok_or_else(|| ApiError::protocol(format!("bad depth qty {:?}", level[1])))?;
    let id = price_id(price);

    if qty == 0.0 {
        if u.contains(side, id) {
            u.apply(side, BookOp::Remove, id, None, None);
        }
    } else if u.contains(side, id) {
        u.apply(side, BookOp::Modify, id, None, Some(qty));
    } else {
        u.apply(side, BookOp::Add, id, Some(price), Some(qty));
    }
    Ok(())
}

fn fill_avg_price(v: &serde_json::Value) -> Option<f64> {
    let fills = v.get("fills")?.as_array()?;
    let mut qty_sum = 0.0;
    let mut notional = 0.0;
    for f in fills {
        let px = f.get("price").and_then(value_f64)?;
        let qty = f.get("qty").and_then(value_f64)?;
        qty_sum += qty;
        notional += px * qty;
    }
    (qty_sum > 0.0).then(|| notional / qty_sum)
}

// ---- REST wire shapes ----

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthSnapshot {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct DepthUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

fn snapshot_levels(rows: &[[String; 2]]) -> Result<Vec<crate::book::BookEntry>, ApiError> {
    rows.iter()
        .map(|row| {
            let price: f64 = row[0]
                .parse()
                .ok()
                .filter(|p: &f64| p.is_finite())
                .ok_or_else(|| ApiError::protocol(format!("bad snapshot price {:?}", row[0])))?;
            let amount: f64 = row[1]
                .parse()
                .ok()
                .filter(|q: &f64| q.is_finite())
                .ok_or_else(|| ApiError::protocol(format!("bad snapshot qty {:?}", row[1])))?;
            Ok(crate::book::BookEntry { id: price_id(price), price, amount })
        })
        .collect()
}

#[async_trait]
impl ExchangeApi for BinanceExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ApiError> {
        let body = self
            .rest
            .get(&format!("{}/api/v3/time", self.rest_base), "time")
            .await?;
        let v: serde_json::Value = serde_json::from_str(&body).map_err(bad_json)?;
        v.get("serverTime")
            .and_then(|t| t.as_i64())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ApiError::protocol("serverTime missing or out of range"))
    }

    async fn load_instruments(&self) -> Result<Vec<Instrument>, ApiError> {
        let body = self
            .rest
            .get(&format!("{}/api/v3/exchangeInfo", self.rest_base), "exchangeInfo")
            .await?;
        let info: ExchangeInfo = serde_json::from_str(&body).map_err(bad_json)?;

        let mut out = Vec::with_capacity(info.symbols.len());
        for s in info.symbols {
            if s.status != "TRADING" {
                continue;
            }
            let mut inst =
                Instrument::new(ExchangeKind::Binance, &s.symbol, &s.base_asset, &s.quote_asset);
            inst.tick_size = s
                .filters
                .iter()
                .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("PRICE_FILTER"))
                .and_then(|f| f.get("tickSize"))
                .and_then(value_f64)
                .unwrap_or(0.0);
            inst.fee = 0.001;
            out.push(inst);
        }
        Ok(out)
    }

    async fn refresh_instruments(&self, markets: &MarketTable) -> Result<(), ApiError> {
        if !self.refresh_gate.try_pass() {
            return Ok(());
        }
        let body = self
            .rest
            .get(&format!("{}/api/v3/ticker/24hr", self.rest_base), "ticker24h")
            .await?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;
        for row in rows {
            let Some(symbol) = row.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            let Some(market) = markets.get(symbol) else {
                continue;
            };
            market.update_instrument(|inst| {
                if let Some(x) = row.get("lastPrice").and_then(value_f64) {
                    inst.last = x;
                }
                if let Some(x) = row.get("highPrice").and_then(value_f64) {
                    inst.hr24_high = x;
                }
                if let Some(x) = row.get("lowPrice").and_then(value_f64) {
                    inst.hr24_low = x;
                }
                if let Some(x) = row.get("volume").and_then(value_f64) {
                    inst.volume = x;
                }
                if let Some(x) = row.get("priceChangePercent").and_then(value_f64) {
                    inst.change = x;
                }
                if let Some(x) = row.get("bidPrice").and_then(value_f64) {
                    inst.highest_bid = x;
                }
                if let Some(x) = row.get("askPrice").and_then(value_f64) {
                    inst.lowest_ask = x;
                }
                inst.updated = Utc::now();
            });
        }
        Ok(())
    }

    async fn book_snapshot(&self, market: &Market, depth: u32) -> Result<(), ApiError> {
        let inst = market.instrument();
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.rest_base, inst.symbol, depth
        );
        let body = self.rest.get(&url, "depth").await?;
        let snap: DepthSnapshot = serde_json::from_str(&body).map_err(bad_json)?;
        let bids = snapshot_levels(&snap.bids)?;
        let asks = snapshot_levels(&snap.asks)?;
        market.book.apply_snapshot(bids, asks);
        market.last_seq.store(snap.last_update_id, Ordering::Release);
        Ok(())
    }

    async fn recent_trades(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeInfoItem>, ApiError> {
        let url = format!(
            "{}/api/v3/aggTrades?symbol={}&startTime={}&endTime={}&limit=1000",
            self.rest_base,
            instrument.symbol,
            start.timestamp_millis(),
            end.timestamp_millis()
        );
        let body = self.rest.get(&url, "aggTrades").await?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let price = require_f64(&row, "p")?;
            let amount = require_f64(&row, "q")?;
            let side = if row.get("m").and_then(|m| m.as_bool()).unwrap_or(false) {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            let ts = row
                .get("T")
                .and_then(|t| t.as_i64())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);
            out.push(TradeInfoItem {
                id: row.get("a").map(|a| a.to_string()).unwrap_or_default(),
                symbol: instrument.symbol.clone(),
                side,
                price,
                amount,
                ts,
            });
        }
        out.reverse(); // newest first
        Ok(out)
    }

    async fn update_balances(&self, account: &AccountInfo) -> Result<(), ApiError> {
        let url = self.signed_url(account, "/api/v3/account", &[])?;
        let body = self
            .rest
            .send(
                self.rest.http().get(url).header("X-MBX-APIKEY", &account.api_key),
                "account",
            )
            .await?;
        // account downloads can carry an error object with a 200 status
        if let Some(err) = parse_error_body(&body) {
            return Err(err);
        }
        let v: serde_json::Value = serde_json::from_str(&body).map_err(bad_json)?;
        let rows = v
            .get("balances")
            .and_then(|b| b.as_array())
            .ok_or_else(|| ApiError::protocol("account response missing balances"))?;

        let mut next = Vec::new();
        for row in rows {
            let Some(asset) = row.get("asset").and_then(|a| a.as_str()) else {
                continue;
            };
            let free = row.get("free").and_then(value_f64).unwrap_or(0.0);
            let locked = row.get("locked").and_then(value_f64).unwrap_or(0.0);
            if free + locked <= 0.0 {
                continue;
            }
            next.push(BalanceInfo {
                currency: asset.to_string(),
                balance: free + locked,
                available: free,
                on_orders: locked,
            });
        }
        account.replace_balances(next);
        Ok(())
    }

    async fn update_opened_orders(
        &self,
        account: &AccountInfo,
        instrument: Option<&Instrument>,
    ) -> Result<(), ApiError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(inst) = instrument {
            params.push(("symbol", inst.symbol.clone()));
        }
        let url = self.signed_url(account, "/api/v3/openOrders", &params)?;
        let body = self
            .rest
            .send(
                self.rest.http().get(url).header("X-MBX-APIKEY", &account.api_key),
                "openOrders",
            )
            .await?;
        if let Some(err) = parse_error_body(&body) {
            return Err(err);
        }
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;

        let mut next = Vec::new();
        for row in rows {
            let order_id = row
                .get("orderId")
                .map(|id| id.to_string())
                .ok_or_else(|| ApiError::protocol("open order missing orderId"))?;
            let symbol = row
                .get("symbol")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            let side = row
                .get("side")
                .and_then(|s| s.as_str())
                .and_then(OrderSide::parse)
                .unwrap_or(OrderSide::Buy);
            let price = row.get("price").and_then(value_f64).unwrap_or(0.0);
            let amount = row.get("origQty").and_then(value_f64).unwrap_or(0.0);
            let ts = row
                .get("time")
                .and_then(|t| t.as_i64())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);
            next.push(OpenedOrderInfo {
                order_id,
                symbol,
                side,
                price,
                amount,
                total: price * amount,
                ts,
            });
        }
        account.replace_opened_orders(next);
        Ok(())
    }

    async fn place_order(
        &self,
        account: &AccountInfo,
        instrument: &Instrument,
        side: OrderSide,
        kind: OrderKind,
        price: f64,
        amount: f64,
    ) -> Result<TradingResult, ApiError> {
        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", instrument.symbol.clone()),
            ("side", side_str.to_string()),
        ];
        match kind {
            OrderKind::Limit => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("quantity", format!("{amount}")));
                params.push(("price", format!("{price}")));
            }
            // spot has no position to close; both map to a plain market order
            OrderKind::Market | OrderKind::MarketClose => {
                params.push(("type", "MARKET".to_string()));
                params.push(("quantity", format!("{amount}")));
            }
        }
        let url = self.signed_url(account, "/api/v3/order", &params)?;
        let body = self
            .rest
            .send(
                self.rest.http().post(url).header("X-MBX-APIKEY", &account.api_key),
                "order",
            )
            .await?;
        self.parse_trade_result(&body, side, price, amount)
    }

    async fn cancel_order(
        &self,
        account: &AccountInfo,
        instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError> {
        let params: Vec<(&str, String)> = vec![
            ("symbol", instrument.symbol.clone()),
            ("orderId", order_id.to_string()),
        ];
        let url = self.signed_url(account, "/api/v3/order", &params)?;
        let body = self
            .rest
            .send(
                self.rest.http().delete(url).header("X-MBX-APIKEY", &account.api_key),
                "cancelOrder",
            )
            .await?;
        self.parse_trade_result(&body, OrderSide::Buy, 0.0, 0.0)
    }

    async fn order_status(
        &self,
        account: &AccountInfo,
        instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError> {
        let params: Vec<(&str, String)> = vec![
            ("symbol", instrument.symbol.clone()),
            ("orderId", order_id.to_string()),
        ];
        let url = self.signed_url(account, "/api/v3/order", &params)?;
        let body = self
            .rest
            .send(
                self.rest.http().get(url).header("X-MBX-APIKEY", &account.api_key),
                "orderStatus",
            )
            .await?;
        self.parse_trade_result(&body, OrderSide::Buy, 0.0, 0.0)
    }

    fn stream_address(&self, kind: StreamKind, instrument: &Instrument) -> String {
        match kind {
            StreamKind::Ticker => format!(
                "{}/{}@bookTicker",
                self.ws_base,
                instrument.symbol.to_lowercase()
            ),
            // bare socket; the topic goes in a SUBSCRIBE frame
            StreamKind::Book | StreamKind::Trades => self.ws_base.clone(),
        }
    }

    fn subscribe_payload(&self, kind: StreamKind, instrument: &Instrument) -> Option<String> {
        let topic = match kind {
            StreamKind::Ticker => return None,
            StreamKind::Book => format!("{}@depth@100ms", instrument.symbol.to_lowercase()),
            StreamKind::Trades => format!("{}@trade", instrument.symbol.to_lowercase()),
        };
        Some(json!({ "method": "SUBSCRIBE", "params": [topic], "id": 1 }).to_string())
    }

    fn apply_stream_message(
        &self,
        kind: StreamKind,
        markets: &MarketTable,
        raw: &str,
    ) -> Result<DispatchOutcome, ApiError> {
        let v: serde_json::Value = serde_json::from_str(raw).map_err(bad_json)?;

        if let Some(err) = parse_error_body(raw) {
            return Err(err);
        }
        // SUBSCRIBE ack: {"result":null,"id":1}
        if v.get("id").is_some() && v.get("e").is_none() && v.get("s").is_none() {
            return Ok(DispatchOutcome::Ignored);
        }

        match (kind, v.get("e").and_then(|e| e.as_str())) {
            (StreamKind::Book, Some("depthUpdate")) => self.apply_depth(markets, v),
            (StreamKind::Trades, Some("trade")) => self.apply_trade(markets, &v),
            // bookTicker frames carry no event tag
            (StreamKind::Ticker, None) => self.apply_book_ticker(markets, &v),
            _ => Ok(DispatchOutcome::Ignored),
        }
    }
}
