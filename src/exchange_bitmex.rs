// ===============================
// src/exchange_bitmex.rs
// ===============================
//
// Bitmex derivatives connector.
//
// REST under /api/v1; private endpoints sign verb+path+expires+body and
// carry `api-key` / `api-expires` / `api-signature` headers. Wallet
// amounts arrive in native units (XBt satoshi, USDt micro) and are scaled
// to whole coins here.
//
// Streams subscribe via the URL (`/realtime?subscribe=topic`), so there is
// no subscribe frame. Every frame is `{"table","action","data":[..]}`;
// orderBookL2 rows carry venue-assigned level ids, which map straight onto
// the id-keyed book.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::book::{BookEntry, BookOp, BookSide};
use crate::domain::{
    AccountInfo, BalanceInfo, ExchangeKind, Instrument, Market, MarketTable, OpenedOrderInfo,
    OrderKind, OrderSide, PositionSide, StreamKind, TradeInfoItem, TradingResult,
};
use crate::error::ApiError;
use crate::exchange::{
    bad_json, parse_error_body, value_f64, DispatchOutcome, ExchangeApi, RestClient, ThrottleGate,
    TickUpdate,
};
use crate::sign::{encode_query, expires_secs, sign_request};

const TICKER_REFRESH_GAP: Duration = Duration::from_secs(5);

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

/// Wallet currencies come in venue spelling and native scale.
fn normalize_currency(raw: &str) -> (String, f64) {
    match raw {
        "XBt" => ("XBT".to_string(), 1e8),
        "USDt" => ("USDT".to_string(), 1e6),
        "Gwei" => ("ETH".to_string(), 1e9),
        other => (other.to_uppercase(), 1.0),
    }
}

fn book_side(s: &str) -> Option<BookSide> {
    match s {
        "Buy" => Some(BookSide::Bid),
        "Sell" => Some(BookSide::Ask),
        _ => None,
    }
}

pub struct BitmexExchange {
    rest: RestClient,
    rest_base: String,
    ws_base: String,
    /// Seconds of validity for each signed request.
    expires_lead: u64,
    refresh_gate: ThrottleGate,
}

impl BitmexExchange {
    pub fn new(rest: RestClient, rest_base: &str, ws_base: &str, expires_lead: u64) -> Self {
        Self {
            rest,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            ws_base: ws_base.trim_end_matches('/').to_string(),
            expires_lead,
            refresh_gate: ThrottleGate::new(TICKER_REFRESH_GAP),
        }
    }

    /// Attach the three auth headers. `path_q` is the path including any
    /// query string, exactly as it goes on the wire.
    fn signed(
        &self,
        req: reqwest::RequestBuilder,
        account: &AccountInfo,
        verb: &str,
        path_q: &str,
        body: &str,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let expires = expires_secs(self.expires_lead);
        let signature = sign_request(&account.api_secret, verb, path_q, expires, body)?;
        Ok(req
            .header("api-key", &account.api_key)
            .header("api-expires", expires.to_string())
            .header("api-signature", signature))
    }

    async fn get_signed(
        &self,
        account: &AccountInfo,
        path_q: &str,
        endpoint: &'static str,
    ) -> Result<String, ApiError> {
        let req = self.rest.http().get(format!("{}{}", self.rest_base, path_q));
        let req = self.signed(req, account, "GET", path_q, "")?;
        self.rest.send(req, endpoint).await
    }

    fn parse_order_payload(
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
        // cancel and filtered queries answer with an array
        let row = match &v {
            serde_json::Value::Array(rows) => rows
                .first()
                .ok_or_else(|| ApiError::protocol("empty order response"))?,
            _ => &v,
        };
        parse_order_row(row, side, fallback_price, fallback_amount)
    }

    fn apply_instrument_rows(
        &self,
        markets: &MarketTable,
        rows: &[serde_json::Value],
    ) -> DispatchOutcome {
        let mut ticks = Vec::new();
        for row in rows {
            let Some(symbol) = row.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            let Some(market) = markets.get(symbol) else {
                continue;
            };
            let quoted =
                row.get("bidPrice").is_some() || row.get("askPrice").is_some();
            market.update_instrument(|inst| patch_instrument(inst, row));
            if quoted {
                let inst = market.instrument();
                if inst.highest_bid > 0.0 && inst.lowest_ask > 0.0 {
                    ticks.push(TickUpdate {
                        symbol: symbol.to_string(),
                        best_bid: inst.highest_bid,
                        best_ask: inst.lowest_ask,
                    });
                }
            }
        }
        if ticks.is_empty() {
            DispatchOutcome::Ignored
        } else {
            DispatchOutcome::Tickers(ticks)
        }
    }

    fn apply_book_rows(
        &self,
        markets: &MarketTable,
        action: &str,
        rows: &[serde_json::Value],
    ) -> Result<DispatchOutcome, ApiError> {
        let Some(symbol) = rows
            .first()
            .and_then(|r| r.get("symbol"))
            .and_then(|s| s.as_str())
        else {
            return Ok(DispatchOutcome::Ignored);
        };
        let Some(market) = markets.get(symbol) else {
            return Ok(DispatchOutcome::Ignored);
        };

        let op = match action {
            "partial" => BookOp::RefreshAll,
            "insert" => BookOp::Add,
            "update" => BookOp::Modify,
            "delete" => BookOp::Remove,
            other => {
                return Err(ApiError::protocol(format!("unknown book action {other:?}")));
            }
        };

        {
            let mut u = market.book.update();
            if matches!(op, BookOp::RefreshAll) {
                u.clear();
            }
            for row in rows {
                let id = row
                    .get("id")
                    .and_then(|i| i.as_u64())
                    .ok_or_else(|| ApiError::protocol("book row missing id"))?;
                let side = row
                    .get("side")
                    .and_then(|s| s.as_str())
                    .and_then(book_side)
                    .ok_or_else(|| ApiError::protocol("book row missing side"))?;
                let price = row.get("price").and_then(value_f64);
                let size = row.get("size").and_then(value_f64);
                u.apply(side, op, id, price, size);
            }
        }

        if market.book.is_dirty() {
            return Ok(DispatchOutcome::BookNeedsResync { symbol: symbol.to_string() });
        }
        let (bid, ask) = market.book.best_pair();
        Ok(DispatchOutcome::BookApplied {
            symbol: symbol.to_string(),
            best_bid: bid.map(|e| e.price),
            best_ask: ask.map(|e| e.price),
        })
    }

    fn apply_trade_rows(
        &self,
        markets: &MarketTable,
        rows: &[serde_json::Value],
    ) -> Result<DispatchOutcome, ApiError> {
        let Some(symbol) = rows
            .first()
            .and_then(|r| r.get("symbol"))
            .and_then(|s| s.as_str())
        else {
            return Ok(DispatchOutcome::Ignored);
        };
        let Some(market) = markets.get(symbol) else {
            return Ok(DispatchOutcome::Ignored);
        };

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(trade_from_row(row)?);
        }
        // frames list trades oldest first; the tape wants newest first
        items.reverse();
        let appended = items.len();
        market.prepend_trades(items);
        Ok(DispatchOutcome::Trades { symbol: symbol.to_string(), appended })
    }
}

fn patch_instrument(inst: &mut Instrument, row: &serde_json::Value) {
    if let Some(x) = row.get("lastPrice").and_then(value_f64) {
        inst.last = x;
    }
    if let Some(x) = row.get("highPrice").and_then(value_f64) {
        inst.hr24_high = x;
    }
    if let Some(x) = row.get("lowPrice").and_then(value_f64) {
        inst.hr24_low = x;
    }
    if let Some(x) = row.get("volume24h").and_then(value_f64) {
        inst.volume = x;
    }
    if let Some(x) = row.get("bidPrice").and_then(value_f64) {
        inst.highest_bid = x;
    }
    if let Some(x) = row.get("askPrice").and_then(value_f64) {
        inst.lowest_ask = x;
    }
    if let Some(x) = row.get("tickSize").and_then(value_f64) {
        inst.tick_size = x;
    }
    if let (Some(last), Some(prev)) = (
        row.get("lastPrice").and_then(value_f64),
        row.get("prevPrice24h").and_then(value_f64),
    ) {
        if prev > 0.0 {
            inst.change = (last - prev) / prev * 100.0;
        }
    }
    inst.updated = Utc::now();
}

fn trade_from_row(row: &serde_json::Value) -> Result<TradeInfoItem, ApiError> {
    let symbol = row
        .get("symbol")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string();
    let price = row
        .get("price")
        .and_then(value_f64)
        .ok_or_else(|| ApiError::protocol("trade row missing price"))?;
    let amount = row
        .get("size")
        .and_then(value_f64)
        .ok_or_else(|| ApiError::protocol("trade row missing size"))?;
    let side = row
        .get("side")
        .and_then(|s| s.as_str())
        .and_then(OrderSide::parse)
        .unwrap_or(OrderSide::Buy);
    let ts = row
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(parse_iso)
        .unwrap_or_else(Utc::now);
    let id = row
        .get("trdMatchID")
        .and_then(|i| i.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| ts.timestamp_millis().to_string());
    Ok(TradeInfoItem { id, symbol, side, price, amount, ts })
}

fn parse_order_row(
    row: &serde_json::Value,
    side: OrderSide,
    fallback_price: f64,
    fallback_amount: f64,
) -> Result<TradingResult, ApiError> {
    let order_id = row
        .get("orderID")
        .and_then(|id| id.as_str())
        .map(str::to_string)
        .ok_or_else(|| ApiError::protocol("order response missing orderID"))?;
    let symbol = row
        .get("symbol")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string();
    let side = row
        .get("side")
        .and_then(|s| s.as_str())
        .and_then(OrderSide::parse)
        .unwrap_or(side);
    let status = row
        .get("ordStatus")
        .and_then(|s| s.as_str())
        .unwrap_or("New")
        .to_string();
    let amount = row
        .get("orderQty")
        .and_then(value_f64)
        .filter(|q| *q > 0.0)
        .unwrap_or(fallback_amount);
    // market orders carry no limit price; fall back to the average fill
    let price = row
        .get("price")
        .and_then(value_f64)
        .filter(|p| *p > 0.0)
        .or_else(|| row.get("avgPx").and_then(value_f64).filter(|p| *p > 0.0))
        .unwrap_or(fallback_price);
    let ts = row
        .get("transactTime")
        .or_else(|| row.get("timestamp"))
        .and_then(|t| t.as_str())
        .and_then(parse_iso)
        .unwrap_or_else(Utc::now);

    Ok(TradingResult {
        order_id,
        symbol,
        side,
        position_side: Some(match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }),
        price,
        amount,
        total: price * amount,
        status: status.clone(),
        filled: status == "Filled",
        ts,
    })
}

#[derive(Debug, Deserialize)]
struct L2Row {
    id: u64,
    side: String,
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    price: Option<f64>,
}

#[async_trait]
impl ExchangeApi for BitmexExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Bitmex
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ApiError> {
        // no dedicated clock endpoint; read the timestamp off a one-row page
        let url = format!("{}/api/v1/instrument?count=1&reverse=true", self.rest_base);
        let body = self.rest.get(&url, "time").await?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;
        rows.first()
            .and_then(|r| r.get("timestamp"))
            .and_then(|t| t.as_str())
            .and_then(parse_iso)
            .ok_or_else(|| ApiError::protocol("instrument page missing timestamp"))
    }

    async fn load_instruments(&self) -> Result<Vec<Instrument>, ApiError> {
        let url = format!("{}/api/v1/instrument/active", self.rest_base);
        let body = self.rest.get(&url, "instruments").await?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(symbol) = row.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            if row.get("state").and_then(|s| s.as_str()) != Some("Open") {
                continue;
            }
            let underlying = row
                .get("underlying")
                .and_then(|u| u.as_str())
                .unwrap_or_default();
            let quote = row
                .get("quoteCurrency")
                .and_then(|q| q.as_str())
                .unwrap_or_default();
            let mut inst = Instrument::new(ExchangeKind::Bitmex, symbol, underlying, quote);
            inst.contract = true;
            inst.contract_value = row.get("lotSize").and_then(value_f64).unwrap_or(1.0);
            inst.fee = row.get("takerFee").and_then(value_f64).unwrap_or(0.0);
            patch_instrument(&mut inst, &row);
            out.push(inst);
        }
        Ok(out)
    }

    async fn refresh_instruments(&self, markets: &MarketTable) -> Result<(), ApiError> {
        if !self.refresh_gate.try_pass() {
            return Ok(());
        }
        let url = format!("{}/api/v1/instrument/active", self.rest_base);
        let body = self.rest.get(&url, "instruments").await?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;
        for row in rows {
            let Some(symbol) = row.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            if let Some(market) = markets.get(symbol) {
                market.update_instrument(|inst| patch_instrument(inst, &row));
            }
        }
        Ok(())
    }

    async fn book_snapshot(&self, market: &Market, depth: u32) -> Result<(), ApiError> {
        let inst = market.instrument();
        let url = format!(
            "{}/api/v1/orderBook/L2?symbol={}&depth={}",
            self.rest_base, inst.symbol, depth
        );
        let body = self.rest.get(&url, "orderBookL2").await?;
        let rows: Vec<L2Row> = serde_json::from_str(&body).map_err(bad_json)?;

        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for row in rows {
            let side = book_side(&row.side)
                .ok_or_else(|| ApiError::protocol(format!("bad book side {:?}", row.side)))?;
            let (Some(price), Some(amount)) = (row.price, row.size) else {
                return Err(ApiError::protocol("snapshot row missing price or size"));
            };
            let entry = BookEntry { id: row.id, price, amount };
            match side {
                BookSide::Bid => bids.push(entry),
                BookSide::Ask => asks.push(entry),
            }
        }
        market.book.apply_snapshot(bids, asks);
        Ok(())
    }

    async fn recent_trades(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeInfoItem>, ApiError> {
        let query = encode_query(&[
            ("symbol", instrument.symbol.clone()),
            ("startTime", iso(start)),
            ("endTime", iso(end)),
            ("count", "500".to_string()),
            ("reverse", "true".to_string()),
        ]);
        let url = format!("{}/api/v1/trade?{}", self.rest_base, query);
        let body = self.rest.get(&url, "trades").await?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;
        // reverse=true already yields newest first
        rows.iter().map(trade_from_row).collect()
    }

    async fn update_balances(&self, account: &AccountInfo) -> Result<(), ApiError> {
        let path_q = "/api/v1/user/margin?currency=all";
        let body = self.get_signed(account, path_q, "margin").await?;
        if let Some(err) = parse_error_body(&body) {
            return Err(err);
        }
        let v: serde_json::Value = serde_json::from_str(&body).map_err(bad_json)?;
        let rows: Vec<&serde_json::Value> = match &v {
            serde_json::Value::Array(rows) => rows.iter().collect(),
            other => vec![other],
        };

        let mut next = Vec::new();
        for row in rows {
            let Some(raw) = row.get("currency").and_then(|c| c.as_str()) else {
                continue;
            };
            let (currency, scale) = normalize_currency(raw);
            let balance = row.get("walletBalance").and_then(value_f64).unwrap_or(0.0) / scale;
            let available = row
                .get("availableMargin")
                .and_then(value_f64)
                .map(|x| x / scale)
                .unwrap_or(balance);
            if balance <= 0.0 {
                continue;
            }
            next.push(BalanceInfo {
                currency,
                balance,
                available,
                on_orders: (balance - available).max(0.0),
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
        let mut params: Vec<(&str, String)> = vec![
            ("filter", json!({"open": true}).to_string()),
            ("count", "500".to_string()),
            ("reverse", "true".to_string()),
        ];
        if let Some(inst) = instrument {
            params.push(("symbol", inst.symbol.clone()));
        }
        let path_q = format!("/api/v1/order?{}", encode_query(&params));
        let body = self.get_signed(account, &path_q, "openOrders").await?;
        if let Some(err) = parse_error_body(&body) {
            return Err(err);
        }
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).map_err(bad_json)?;

        let mut next = Vec::new();
        for row in rows {
            let order_id = row
                .get("orderID")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| ApiError::protocol("open order missing orderID"))?;
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
            let amount = row.get("orderQty").and_then(value_f64).unwrap_or(0.0);
            let ts = row
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(parse_iso)
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
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let mut order = json!({
            "symbol": instrument.symbol,
            "side": side_str,
        });
        match kind {
            OrderKind::Limit => {
                order["ordType"] = json!("Limit");
                order["orderQty"] = json!(amount);
                order["price"] = json!(price);
            }
            OrderKind::Market => {
                order["ordType"] = json!("Market");
                order["orderQty"] = json!(amount);
            }
            OrderKind::MarketClose => {
                // Close with no quantity flattens the whole position
                order["ordType"] = json!("Market");
                order["execInst"] = json!("Close");
                if amount > 0.0 {
                    order["orderQty"] = json!(amount);
                }
            }
        }
        let payload = order.to_string();
        let path = "/api/v1/order";
        let req = self
            .rest
            .http()
            .post(format!("{}{}", self.rest_base, path))
            .header("content-type", "application/json")
            .body(payload.clone());
        let req = self.signed(req, account, "POST", path, &payload)?;
        let body = self.rest.send(req, "order").await?;
        self.parse_order_payload(&body, side, price, amount)
    }

    async fn cancel_order(
        &self,
        account: &AccountInfo,
        _instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError> {
        let payload = json!({ "orderID": order_id }).to_string();
        let path = "/api/v1/order";
        let req = self
            .rest
            .http()
            .delete(format!("{}{}", self.rest_base, path))
            .header("content-type", "application/json")
            .body(payload.clone());
        let req = self.signed(req, account, "DELETE", path, &payload)?;
        let body = self.rest.send(req, "cancelOrder").await?;
        self.parse_order_payload(&body, OrderSide::Buy, 0.0, 0.0)
    }

    async fn order_status(
        &self,
        account: &AccountInfo,
        instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError> {
        let params: Vec<(&str, String)> = vec![
            ("symbol", instrument.symbol.clone()),
            ("filter", json!({ "orderID": order_id }).to_string()),
            ("count", "1".to_string()),
        ];
        let path_q = format!("/api/v1/order?{}", encode_query(&params));
        let body = self.get_signed(account, &path_q, "orderStatus").await?;
        self.parse_order_payload(&body, OrderSide::Buy, 0.0, 0.0)
    }

    fn stream_address(&self, kind: StreamKind, instrument: &Instrument) -> String {
        match kind {
            // the instrument topic is venue-wide; rows name their symbol
            StreamKind::Ticker => format!("{}?subscribe=instrument", self.ws_base),
            StreamKind::Book => {
                format!("{}?subscribe=orderBookL2:{}", self.ws_base, instrument.symbol)
            }
            StreamKind::Trades => {
                format!("{}?subscribe=trade:{}", self.ws_base, instrument.symbol)
            }
        }
    }

    fn apply_stream_message(
        &self,
        _kind: StreamKind,
        markets: &MarketTable,
        raw: &str,
    ) -> Result<DispatchOutcome, ApiError> {
        if raw == "pong" {
            return Ok(DispatchOutcome::Ignored);
        }
        if let Some(err) = parse_error_body(raw) {
            return Err(err);
        }
        let v: serde_json::Value = serde_json::from_str(raw).map_err(bad_json)?;
        // welcome banner and subscribe acks
        if v.get("info").is_some() || v.get("success").is_some() {
            return Ok(DispatchOutcome::Ignored);
        }
        let Some(table) = v.get("table").and_then(|t| t.as_str()) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let action = v.get("action").and_then(|a| a.as_str()).unwrap_or("partial");
        let Some(rows) = v.get("data").and_then(|d| d.as_array()) else {
            return Ok(DispatchOutcome::Ignored);
        };

        // frames are routed by table; every socket sees acks and keepalives
        match table {
            "instrument" => Ok(self.apply_instrument_rows(markets, rows)),
            "orderBookL2" => self.apply_book_rows(markets, action, rows),
            "trade" => self.apply_trade_rows(markets, rows),
            _ => Ok(DispatchOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiter;
    use std::sync::Arc;

    fn bitmex() -> BitmexExchange {
        let limiter = RateLimiter::new(ExchangeKind::Bitmex, Duration::from_secs(60), 120);
        BitmexExchange::new(
            RestClient::new(ExchangeKind::Bitmex, limiter),
            "https://www.bitmex.com",
            "wss://ws.bitmex.com/realtime",
            60,
        )
    }

    fn table(symbol: &str) -> MarketTable {
        let mut inst = Instrument::new(ExchangeKind::Bitmex, symbol, "XBT", "USD");
        inst.contract = true;
        let mut t = MarketTable::default();
        t.insert(symbol.to_string(), Arc::new(Market::new(inst)));
        t
    }

    #[test]
    fn control_frames_are_ignored() {
        let ex = bitmex();
        let markets = table("XBTUSD");
        for raw in [
            "pong",
            r#"{"info":"Welcome to the Realtime API.","version":"2.0","timestamp":"2023-01-01T00:00:00.000Z"}"#,
            r#"{"success":true,"subscribe":"orderBookL2:XBTUSD","request":{}}"#,
        ] {
            assert_eq!(
                ex.apply_stream_message(StreamKind::Book, &markets, raw).unwrap(),
                DispatchOutcome::Ignored
            );
        }
    }

    #[test]
    fn error_frames_classify_by_text() {
        let ex = bitmex();
        let markets = table("XBTUSD");
        let raw = r#"{"error":"Rate limit exceeded, retry in 1 seconds.","status":429}"#;
        assert!(matches!(
            ex.apply_stream_message(StreamKind::Book, &markets, raw),
            Err(ApiError::RateLimit)
        ));
    }

    #[test]
    fn instrument_rows_patch_ticker_and_emit() {
        let ex = bitmex();
        let markets = table("XBTUSD");
        let raw = r#"{"table":"instrument","action":"update","data":[
            {"symbol":"XBTUSD","lastPrice":65000.5,"bidPrice":65000.0,"askPrice":65000.5,
             "volume24h":123456789,"prevPrice24h":64000.0},
            {"symbol":"ETHUSD","bidPrice":3000.0,"askPrice":3000.5}
        ]}"#;
        let out = ex.apply_stream_message(StreamKind::Ticker, &markets, raw).unwrap();
        assert_eq!(
            out,
            DispatchOutcome::Tickers(vec![TickUpdate {
                symbol: "XBTUSD".into(),
                best_bid: 65000.0,
                best_ask: 65000.5,
            }])
        );
        let inst = markets["XBTUSD"].instrument();
        assert_eq!(inst.last, 65000.5);
        assert!((inst.change - (65000.5 - 64000.0) / 64000.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn book_lifecycle_partial_insert_update_delete() {
        let ex = bitmex();
        let markets = table("XBTUSD");
        let market = &markets["XBTUSD"];

        let partial = r#"{"table":"orderBookL2","action":"partial","data":[
            {"symbol":"XBTUSD","id":100,"side":"Sell","size":10,"price":65010.0},
            {"symbol":"XBTUSD","id":101,"side":"Sell","size":5,"price":65005.0},
            {"symbol":"XBTUSD","id":200,"side":"Buy","size":7,"price":65000.0}
        ]}"#;
        let out = ex.apply_stream_message(StreamKind::Book, &markets, partial).unwrap();
        assert_eq!(
            out,
            DispatchOutcome::BookApplied {
                symbol: "XBTUSD".into(),
                best_bid: Some(65000.0),
                best_ask: Some(65005.0),
            }
        );

        let insert = r#"{"table":"orderBookL2","action":"insert","data":[
            {"symbol":"XBTUSD","id":201,"side":"Buy","size":3,"price":64999.5}
        ]}"#;
        ex.apply_stream_message(StreamKind::Book, &markets, insert).unwrap();

        // updates carry no price
        let update = r#"{"table":"orderBookL2","action":"update","data":[
            {"symbol":"XBTUSD","id":101,"side":"Sell","size":8}
        ]}"#;
        ex.apply_stream_message(StreamKind::Book, &markets, update).unwrap();
        assert_eq!(market.book.best_ask().map(|e| e.amount), Some(8.0));

        let delete = r#"{"table":"orderBookL2","action":"delete","data":[
            {"symbol":"XBTUSD","id":100,"side":"Sell"}
        ]}"#;
        let out = ex.apply_stream_message(StreamKind::Book, &markets, delete).unwrap();
        assert_eq!(
            out,
            DispatchOutcome::BookApplied {
                symbol: "XBTUSD".into(),
                best_bid: Some(65000.0),
                best_ask: Some(65005.0),
            }
        );
        assert_eq!(market.book.depth(), (2, 1));
        assert!(!market.book.is_dirty());

        // contract market keeps the inverted ask view in step
        let inv = market.book.inverted_asks().unwrap();
        assert_eq!(inv.len(), 1);
        assert_eq!(inv[0].price, 65005.0);
    }

    #[test]
    fn unknown_id_update_requests_resync() {
        let ex = bitmex();
        let markets = table("XBTUSD");
        let raw = r#"{"table":"orderBookL2","action":"update","data":[
            {"symbol":"XBTUSD","id":999,"side":"Buy","size":4}
        ]}"#;
        let out = ex.apply_stream_message(StreamKind::Book, &markets, raw).unwrap();
        assert_eq!(out, DispatchOutcome::BookNeedsResync { symbol: "XBTUSD".into() });
        assert!(markets["XBTUSD"].book.is_dirty());
    }

    #[test]
    fn trade_rows_arrive_oldest_first_and_land_newest_first() {
        let ex = bitmex();
        let markets = table("XBTUSD");
        let raw = r#"{"table":"trade","action":"insert","data":[
            {"timestamp":"2023-01-01T00:00:00.100Z","symbol":"XBTUSD","side":"Buy","size":10,"price":65000.0,"trdMatchID":"a"},
            {"timestamp":"2023-01-01T00:00:00.200Z","symbol":"XBTUSD","side":"Sell","size":20,"price":64999.5,"trdMatchID":"b"}
        ]}"#;
        let out = ex.apply_stream_message(StreamKind::Trades, &markets, raw).unwrap();
        assert_eq!(out, DispatchOutcome::Trades { symbol: "XBTUSD".into(), appended: 2 });
        let trades = markets["XBTUSD"].trades();
        assert_eq!(trades[0].id, "b");
        assert_eq!(trades[0].side, OrderSide::Sell);
        assert_eq!(trades[1].id, "a");
    }

    #[test]
    fn order_payload_array_takes_first_row() {
        let ex = bitmex();
        let body = r#"[{
            "orderID":"6fDDe1-10a6-4b4d","symbol":"XBTUSD","side":"Sell",
            "orderQty":100,"price":null,"avgPx":65001.5,"ordType":"Market",
            "ordStatus":"Filled","transactTime":"2023-01-01T00:00:01.000Z"
        }]"#;
        let res = ex.parse_order_payload(body, OrderSide::Sell, 0.0, 0.0).unwrap();
        assert_eq!(res.order_id, "6fDDe1-10a6-4b4d");
        assert!(res.filled);
        assert_eq!(res.price, 65001.5);
        assert_eq!(res.position_side, Some(PositionSide::Short));
    }

    #[test]
    fn order_error_object_maps_to_taxonomy() {
        let ex = bitmex();
        let body = r#"{"error":{"message":"Account has insufficient Available Balance","name":"ValidationError"}}"#;
        match ex.parse_order_payload(body, OrderSide::Buy, 1.0, 1.0) {
            Err(ApiError::Exchange { code, message }) => {
                assert_eq!(code, "ValidationError");
                assert!(message.contains("insufficient"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wallet_currencies_normalize_scale() {
        assert_eq!(normalize_currency("XBt"), ("XBT".to_string(), 1e8));
        assert_eq!(normalize_currency("USDt"), ("USDT".to_string(), 1e6));
        assert_eq!(normalize_currency("Gwei"), ("ETH".to_string(), 1e9));
        assert_eq!(normalize_currency("sol"), ("SOL".to_string(), 1.0));
    }
}
