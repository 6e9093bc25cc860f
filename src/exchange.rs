// ===============================
// src/exchange.rs
// ===============================
//
// The connector seam: everything exchange-specific lives behind
// `ExchangeApi`, everything generic (request gating, header ingestion,
// status classification) lives in `RestClient`.
//
// `apply_stream_message` is deliberately a pure function of market state
// plus one raw payload — live sockets and capture replay drive the same
// code path.

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::{
    AccountInfo, ExchangeKind, Instrument, Market, MarketTable, OrderKind, OrderSide, StreamKind,
    TradeInfoItem, TradingResult,
};
use crate::error::ApiError;
use crate::metrics::REST_REQUESTS;
use crate::ratelimit::RateLimiter;

/// One best bid/ask move extracted from a stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct TickUpdate {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
}

/// What applying one raw stream message did to market state.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Ticker fields updated, possibly for many symbols in one frame.
    Tickers(Vec<TickUpdate>),
    /// A book diff batch was applied; the resulting best pair is attached.
    BookApplied {
        symbol: String,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
    },
    /// The book lost sync and wants a fresh REST snapshot.
    BookNeedsResync { symbol: String },
    /// Trades appended to the tape.
    Trades { symbol: String, appended: usize },
    /// Recognized but nothing to apply (acks, keepalives, unknown symbols).
    Ignored,
}

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    async fn server_time(&self) -> Result<DateTime<Utc>, ApiError>;

    /// Full instrument table for the venue (filtered to usable markets).
    async fn load_instruments(&self) -> Result<Vec<Instrument>, ApiError>;

    /// Refresh ticker fields of the given markets in place. Implementations
    /// self-throttle; calling often is safe.
    async fn refresh_instruments(&self, markets: &MarketTable) -> Result<(), ApiError>;

    /// Replace the market's book from a REST snapshot.
    async fn book_snapshot(&self, market: &Market, depth: u32) -> Result<(), ApiError>;

    /// Trades in `[start, end)`, newest first.
    async fn recent_trades(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeInfoItem>, ApiError>;

    async fn update_balances(&self, account: &AccountInfo) -> Result<(), ApiError>;

    async fn update_opened_orders(
        &self,
        account: &AccountInfo,
        instrument: Option<&Instrument>,
    ) -> Result<(), ApiError>;

    async fn place_order(
        &self,
        account: &AccountInfo,
        instrument: &Instrument,
        side: OrderSide,
        kind: OrderKind,
        price: f64,
        amount: f64,
    ) -> Result<TradingResult, ApiError>;

    async fn cancel_order(
        &self,
        account: &AccountInfo,
        instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError>;

    async fn order_status(
        &self,
        account: &AccountInfo,
        instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError>;

    /// WebSocket address for one subscription. Recomputed on every
    /// reconnect attempt, so venue-side URL changes are picked up.
    fn stream_address(&self, kind: StreamKind, instrument: &Instrument) -> String;

    /// Optional subscribe frame to send right after the socket opens.
    fn subscribe_payload(&self, _kind: StreamKind, _instrument: &Instrument) -> Option<String> {
        None
    }

    /// How long a stream may stay silent before it counts as stalled.
    fn allowed_stream_delay(&self) -> Duration {
        Duration::from_secs(15)
    }

    /// Apply one raw stream payload against the market table.
    fn apply_stream_message(
        &self,
        kind: StreamKind,
        markets: &MarketTable,
        raw: &str,
    ) -> Result<DispatchOutcome, ApiError>;
}

/// All exchange connectors, built once at startup and handed around as a
/// plain value (no global singletons).
#[derive(Default)]
pub struct ExchangeRegistry {
    map: AHashMap<ExchangeKind, Arc<dyn ExchangeApi>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self { map: AHashMap::new() }
    }

    pub fn insert(&mut self, api: Arc<dyn ExchangeApi>) {
        self.map.insert(api.kind(), api);
    }

    pub fn get(&self, kind: ExchangeKind) -> Option<Arc<dyn ExchangeApi>> {
        self.map.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ExchangeKind> {
        self.map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Shared REST plumbing: one gated request = budget wait + send + header
/// ingestion + status classification.
pub struct RestClient {
    exchange: ExchangeKind,
    http: reqwest::Client,
    pub limiter: RateLimiter,
}

impl RestClient {
    pub fn new(exchange: ExchangeKind, limiter: RateLimiter) -> Self {
        Self {
            exchange,
            http: reqwest::Client::new(),
            limiter,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn get(&self, url: &str, endpoint: &'static str) -> Result<String, ApiError> {
        self.send(self.http.get(url), endpoint).await
    }

    pub async fn send(
        &self,
        req: reqwest::RequestBuilder,
        endpoint: &'static str,
    ) -> Result<String, ApiError> {
        self.limiter.before_request().await;

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                self.count(endpoint, "transport");
                return Err(ApiError::Transport(e));
            }
        };

        self.limiter.on_response(
            header_u32(&resp, "x-ratelimit-limit"),
            header_u32(&resp, "x-ratelimit-remaining"),
            header_i64(&resp, "x-ratelimit-reset"),
        );

        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                self.count(endpoint, "transport");
                return Err(ApiError::Transport(e));
            }
        };

        if status.is_success() {
            self.count(endpoint, "ok");
            Ok(body)
        } else {
            self.count(endpoint, "error");
            Err(classify_status(status, &body))
        }
    }

    fn count(&self, endpoint: &'static str, outcome: &'static str) {
        REST_REQUESTS
            .with_label_values(&[self.exchange.as_str(), endpoint, outcome])
            .inc();
    }
}

fn header_u32(resp: &reqwest::Response, name: &str) -> Option<u32> {
    resp.headers().get(name)?.to_str().ok()?.trim().parse().ok()
}

fn header_i64(resp: &reqwest::Response, name: &str) -> Option<i64> {
    resp.headers().get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Map a non-2xx status plus body into the taxonomy. The documented error
/// object, when present, wins over the raw status.
pub fn classify_status(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ApiError::Authorization,
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit,
        _ => parse_error_body(body)
            .unwrap_or_else(|| ApiError::exchange(status.as_u16().to_string(), truncate(body, 256))),
    }
}

/// Error objects as the supported venues emit them:
/// `{"code":-1121,"msg":"..."}`, `{"error":{"name":"..","message":".."}}`,
/// or `{"error":"plain text"}` on stream frames.
pub fn parse_error_body(body: &str) -> Option<ApiError> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    if let (Some(code), Some(msg)) = (
        v.get("code").and_then(|c| c.as_i64()),
        v.get("msg").and_then(|m| m.as_str()),
    ) {
        return Some(ApiError::exchange(code.to_string(), msg));
    }
    match v.get("error") {
        Some(serde_json::Value::String(text)) => Some(classify_error_text(text)),
        Some(obj) if obj.is_object() => {
            let name = obj
                .get("name")
                .and_then(|n| n.as_str())
                .map(str::to_string)
                .or_else(|| obj.get("code").map(|c| c.to_string()))
                .unwrap_or_else(|| "error".into());
            let message = obj
                .get("message")
                .or_else(|| obj.get("msg"))
                .and_then(|m| m.as_str())
                .unwrap_or_default();
            Some(classify_error_text_or(&name, message))
        }
        _ => None,
    }
}

/// Response body that should have been JSON but was not.
pub fn bad_json(e: serde_json::Error) -> ApiError {
    ApiError::protocol(format!("invalid json: {e}"))
}

/// Text-level classification for venues that spell budget/authorization
/// problems out in prose.
pub fn classify_error_text(text: &str) -> ApiError {
    let lower = text.to_ascii_lowercase();
    if lower.contains("too many requests") || lower.contains("rate limit") {
        ApiError::RateLimit
    } else if lower.contains("forbidden") || lower.contains("access denied") {
        ApiError::Authorization
    } else {
        ApiError::exchange("error", text)
    }
}

fn classify_error_text_or(name: &str, message: &str) -> ApiError {
    match classify_error_text(message) {
        ApiError::Exchange { .. } => ApiError::exchange(name, message),
        other => other,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &s[..cut])
    }
}

/// Accept a numeric JSON field whether it arrives as a number or a quoted
/// string. Non-finite values are rejected.
pub fn value_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    }
}

/// Required numeric field of a JSON object, with a protocol error naming it.
pub fn require_f64(v: &serde_json::Value, key: &str) -> Result<f64, ApiError> {
    v.get(key)
        .and_then(value_f64)
        .ok_or_else(|| ApiError::protocol(format!("missing or non-numeric field {key:?}")))
}

/// Minimum-gap gate for refresh paths that can be triggered by every
/// stream message (e.g. full ticker refetch).
#[derive(Debug)]
pub struct ThrottleGate {
    last: Mutex<Option<Instant>>,
    min_gap: Duration,
}

impl ThrottleGate {
    pub fn new(min_gap: Duration) -> Self {
        Self { last: Mutex::new(None), min_gap }
    }

    /// True when the gate opens; passing closes it for `min_gap`.
    pub fn try_pass(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.min_gap => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Scripted connector shared by gateway, stream and trailing tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;

    pub(crate) struct ScriptedApi {
        pub delay: Duration,
        pub fail_auth: bool,
        pub seen: Mutex<Vec<String>>,
        pub orders: Mutex<Vec<(OrderSide, OrderKind, f64, f64)>>,
        pub results: Mutex<VecDeque<Result<TradingResult, ApiError>>>,
    }

    impl Default for ScriptedApi {
        fn default() -> Self {
            Self {
                delay: Duration::from_secs(2),
                fail_auth: false,
                seen: Mutex::new(Vec::new()),
                orders: Mutex::new(Vec::new()),
                results: Mutex::new(VecDeque::new()),
            }
        }
    }

    impl ScriptedApi {
        pub fn push_result(&self, r: Result<TradingResult, ApiError>) {
            self.results.lock().unwrap().push_back(r);
        }

        pub fn done(symbol: &str, side: OrderSide, price: f64, amount: f64) -> TradingResult {
            TradingResult {
                order_id: "scripted-1".into(),
                symbol: symbol.into(),
                side,
                position_side: None,
                price,
                amount,
                total: price * amount,
                status: "FILLED".into(),
                filled: true,
                ts: Utc::now(),
            }
        }

        fn next_result(
            &self,
            symbol: &str,
            side: OrderSide,
            price: f64,
            amount: f64,
        ) -> Result<TradingResult, ApiError> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::done(symbol, side, price, amount)))
        }
    }

    #[async_trait]
    impl ExchangeApi for ScriptedApi {
        fn kind(&self) -> ExchangeKind {
            ExchangeKind::Binance
        }
        async fn server_time(&self) -> Result<DateTime<Utc>, ApiError> {
            Ok(Utc::now())
        }
        async fn load_instruments(&self) -> Result<Vec<Instrument>, ApiError> {
            Ok(Vec::new())
        }
        async fn refresh_instruments(&self, _markets: &MarketTable) -> Result<(), ApiError> {
            Ok(())
        }
        async fn book_snapshot(&self, _market: &Market, _depth: u32) -> Result<(), ApiError> {
            Ok(())
        }
        async fn recent_trades(
            &self,
            _instrument: &Instrument,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<TradeInfoItem>, ApiError> {
            Ok(Vec::new())
        }
        async fn update_balances(&self, _account: &AccountInfo) -> Result<(), ApiError> {
            Ok(())
        }
        async fn update_opened_orders(
            &self,
            _account: &AccountInfo,
            _instrument: Option<&Instrument>,
        ) -> Result<(), ApiError> {
            Ok(())
        }
        async fn place_order(
            &self,
            _account: &AccountInfo,
            instrument: &Instrument,
            side: OrderSide,
            kind: OrderKind,
            price: f64,
            amount: f64,
        ) -> Result<TradingResult, ApiError> {
            self.orders.lock().unwrap().push((side, kind, price, amount));
            self.next_result(&instrument.symbol, side, price, amount)
        }
        async fn cancel_order(
            &self,
            _account: &AccountInfo,
            instrument: &Instrument,
            _order_id: &str,
        ) -> Result<TradingResult, ApiError> {
            self.next_result(&instrument.symbol, OrderSide::Buy, 0.0, 0.0)
        }
        async fn order_status(
            &self,
            _account: &AccountInfo,
            instrument: &Instrument,
            _order_id: &str,
        ) -> Result<TradingResult, ApiError> {
            self.next_result(&instrument.symbol, OrderSide::Buy, 0.0, 0.0)
        }
        fn stream_address(&self, _kind: StreamKind, _instrument: &Instrument) -> String {
            String::new()
        }
        fn allowed_stream_delay(&self) -> Duration {
            self.delay
        }
        fn apply_stream_message(
            &self,
            _kind: StreamKind,
            _markets: &MarketTable,
            raw: &str,
        ) -> Result<DispatchOutcome, ApiError> {
            if self.fail_auth {
                return Err(ApiError::Authorization);
            }
            self.seen.lock().unwrap().push(raw.to_string());
            Ok(DispatchOutcome::Ignored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            ApiError::Authorization
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimit
        ));
        match classify_status(StatusCode::BAD_REQUEST, r#"{"code":-1121,"msg":"Invalid symbol."}"#) {
            ApiError::Exchange { code, message } => {
                assert_eq!(code, "-1121");
                assert_eq!(message, "Invalid symbol.");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_object_shapes() {
        match parse_error_body(r#"{"error":{"name":"HTTPError","message":"Invalid orderID"}}"#) {
            Some(ApiError::Exchange { code, message }) => {
                assert_eq!(code, "HTTPError");
                assert_eq!(message, "Invalid orderID");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse_error_body(r#"{"error":"Too Many Requests"}"#),
            Some(ApiError::RateLimit)
        ));
        assert!(matches!(
            parse_error_body(r#"{"error":{"name":"AccessDenied","message":"Forbidden"}}"#),
            Some(ApiError::Authorization)
        ));
        assert!(parse_error_body(r#"{"result":"ok"}"#).is_none());
        assert!(parse_error_body("not json").is_none());
    }

    #[test]
    fn numeric_fields_accept_both_encodings() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"a":"25.35190000","b":42.5,"c":"NaN","d":true}"#).unwrap();
        assert_eq!(v.get("a").and_then(value_f64), Some(25.3519));
        assert_eq!(v.get("b").and_then(value_f64), Some(42.5));
        assert_eq!(v.get("c").and_then(value_f64), None);
        assert_eq!(v.get("d").and_then(value_f64), None);
        assert!(require_f64(&v, "missing").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_gate_enforces_min_gap() {
        let gate = ThrottleGate::new(Duration::from_secs(5));
        assert!(gate.try_pass());
        assert!(!gate.try_pass());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!gate.try_pass());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(gate.try_pass());
    }
}
