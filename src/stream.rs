// ===============================
// src/stream.rs
// ===============================
//
// One task per WebSocket subscription. Connect, optionally send the
// subscribe frame, then read until the socket stalls, drops, or errors.
// Each session end maps to a verdict that picks the next delay:
// exponential backoff with jitter for ordinary failures, a fixed cooldown
// when the venue says slow down, a permanent stop when it says no.
//
// Liveness is a read timeout: a stream with nothing to say within the
// connector's allowed delay is treated as dead and reconnected.

use rand::Rng;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use url::Url;

use futures_util::{SinkExt, StreamExt};

use crate::capture::CaptureSink;
use crate::domain::{ExchangeKind, Instrument, MarketTable, StreamKind, TickEvent};
use crate::error::ApiError;
use crate::exchange::{DispatchOutcome, ExchangeApi};
use crate::metrics::{
    BOOK_DEPTH, BOOK_RESYNCS, TICKS, TICKS_BY_SYMBOL, WS_CONNECTED, WS_LAST_MESSAGE_TS,
    WS_RECONNECTS,
};

/// Pause after the venue rate limits a stream, well above ordinary backoff.
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(30);

/// Ask the resync poller for a fresh snapshot of one symbol's book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub exchange: ExchangeKind,
    pub symbol: String,
}

/// How one socket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamVerdict {
    /// No frame within the allowed delay.
    Stalled,
    /// Clean close or EOF.
    Disconnected,
    /// Transport failure.
    Errored,
    /// The venue asked us to back off.
    RateLimited,
    /// Credentials or address rejected; retrying cannot help.
    Forbidden,
}

pub struct StreamConnection {
    api: Arc<dyn ExchangeApi>,
    kind: StreamKind,
    instrument: Instrument,
    markets: Arc<MarketTable>,
    tick_tx: broadcast::Sender<TickEvent>,
    resync_tx: mpsc::Sender<ResyncRequest>,
    capture: Option<CaptureSink>,
}

impl StreamConnection {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        kind: StreamKind,
        instrument: Instrument,
        markets: Arc<MarketTable>,
        tick_tx: broadcast::Sender<TickEvent>,
        resync_tx: mpsc::Sender<ResyncRequest>,
        capture: Option<CaptureSink>,
    ) -> Self {
        Self { api, kind, instrument, markets, tick_tx, resync_tx, capture }
    }

    fn exchange(&self) -> ExchangeKind {
        self.api.kind()
    }

    pub async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            // recomputed every attempt so venue-side URL changes are picked up
            let address = self.api.stream_address(self.kind, &self.instrument);
            match self.run_once(&address, &mut attempt).await {
                StreamVerdict::Forbidden => {
                    error!(
                        exchange = self.exchange().as_str(),
                        stream = self.kind.as_str(),
                        symbol = %self.instrument.symbol,
                        "stream rejected, giving up"
                    );
                    return;
                }
                StreamVerdict::RateLimited => {
                    self.count_reconnect();
                    warn!(
                        exchange = self.exchange().as_str(),
                        stream = self.kind.as_str(),
                        "stream rate limited, cooling down"
                    );
                    sleep(RATE_LIMIT_COOLDOWN).await;
                    attempt = 0;
                }
                verdict => {
                    attempt = attempt.saturating_add(1);
                    self.count_reconnect();
                    let delay = Duration::from_millis(backoff_ms(attempt));
                    warn!(
                        exchange = self.exchange().as_str(),
                        stream = self.kind.as_str(),
                        symbol = %self.instrument.symbol,
                        ?verdict,
                        ?delay,
                        "stream down, reconnecting"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn run_once(&self, address: &str, attempt: &mut u32) -> StreamVerdict {
        if let Err(e) = Url::parse(address) {
            error!(?e, %address, "bad stream address");
            return StreamVerdict::Forbidden;
        }

        info!(
            exchange = self.exchange().as_str(),
            stream = self.kind.as_str(),
            %address,
            "connecting"
        );
        let (mut ws, _resp) = match connect_async(address).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(?e, "connect failed");
                return connect_verdict(e);
            }
        };
        *attempt = 0; // reset backoff
        self.gauge_connected(1);

        if let Some(payload) = self.api.subscribe_payload(self.kind, &self.instrument) {
            if let Err(e) = ws.send(Message::Text(payload)).await {
                warn!(?e, "subscribe send failed");
                self.gauge_connected(0);
                return StreamVerdict::Errored;
            }
        }

        let verdict = loop {
            let frame = match timeout(self.api.allowed_stream_delay(), ws.next()).await {
                Err(_) => break StreamVerdict::Stalled,
                Ok(None) => break StreamVerdict::Disconnected,
                Ok(Some(Err(e))) => {
                    warn!(?e, "read error");
                    break StreamVerdict::Errored;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Message::Text(text) => {
                    self.mark_alive();
                    if let Some(v) = self.on_text(&text) {
                        break v;
                    }
                }
                Message::Ping(payload) => {
                    if ws.send(Message::Pong(payload)).await.is_err() {
                        break StreamVerdict::Errored;
                    }
                }
                Message::Close(frame) => break close_verdict(frame.as_ref()),
                _ => {}
            }
        };
        self.gauge_connected(0);
        verdict
    }

    /// Dispatch one text frame. A malformed frame is logged and skipped;
    /// only budget or authorization trouble ends the session. A book frame
    /// that fails mid-batch may have applied part of its rows, so the book
    /// is marked dirty and a resync requested.
    fn on_text(&self, raw: &str) -> Option<StreamVerdict> {
        if let Some(c) = &self.capture {
            c.record(self.exchange(), &self.instrument.symbol, self.kind, raw);
        }
        match self.api.apply_stream_message(self.kind, &self.markets, raw) {
            Ok(outcome) => {
                self.on_outcome(outcome);
                None
            }
            Err(ApiError::RateLimit) => Some(StreamVerdict::RateLimited),
            Err(ApiError::Authorization) => Some(StreamVerdict::Forbidden),
            Err(e) => {
                warn!(
                    exchange = self.exchange().as_str(),
                    stream = self.kind.as_str(),
                    ?e,
                    "bad frame"
                );
                if self.kind == StreamKind::Book {
                    if let Some(market) = self.markets.get(&self.instrument.symbol) {
                        market.book.mark_dirty();
                    }
                    self.on_outcome(DispatchOutcome::BookNeedsResync {
                        symbol: self.instrument.symbol.clone(),
                    });
                }
                None
            }
        }
    }

    fn on_outcome(&self, outcome: DispatchOutcome) {
        let ex = self.exchange();
        match outcome {
            DispatchOutcome::Tickers(ticks) => {
                for t in ticks {
                    TICKS.inc();
                    TICKS_BY_SYMBOL.with_label_values(&[ex.as_str(), &t.symbol]).inc();
                    let _ = self
                        .tick_tx
                        .send(TickEvent::now(ex, t.symbol, t.best_bid, t.best_ask));
                }
            }
            DispatchOutcome::BookApplied { symbol, .. } => {
                if let Some(market) = self.markets.get(&symbol) {
                    let (bid_depth, ask_depth) = market.book.depth();
                    BOOK_DEPTH
                        .with_label_values(&[ex.as_str(), &symbol, "bid"])
                        .set(bid_depth as i64);
                    BOOK_DEPTH
                        .with_label_values(&[ex.as_str(), &symbol, "ask"])
                        .set(ask_depth as i64);
                }
            }
            DispatchOutcome::BookNeedsResync { symbol } => {
                BOOK_RESYNCS.with_label_values(&[ex.as_str(), &symbol]).inc();
                // a full queue is fine, the dirty flag keeps the request alive
                let _ = self.resync_tx.try_send(ResyncRequest { exchange: ex, symbol });
            }
            DispatchOutcome::Trades { .. } | DispatchOutcome::Ignored => {}
        }
    }

    fn mark_alive(&self) {
        WS_LAST_MESSAGE_TS
            .with_label_values(&[self.exchange().as_str(), self.kind.as_str()])
            .set(chrono::Utc::now().timestamp());
    }

    fn gauge_connected(&self, v: i64) {
        WS_CONNECTED
            .with_label_values(&[self.exchange().as_str(), self.kind.as_str()])
            .set(v);
    }

    fn count_reconnect(&self) {
        WS_RECONNECTS
            .with_label_values(&[self.exchange().as_str(), self.kind.as_str()])
            .inc();
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s ... capped at 32s, plus
/// 0..=250ms so parallel streams do not thunder back together.
fn backoff_ms(attempt: u32) -> u64 {
    let shift = attempt.min(6);
    let factor = 1u64 << shift;
    let base_ms = 500u64.saturating_mul(factor);
    base_ms + rand::thread_rng().gen_range(0..=250)
}

fn connect_verdict(e: tokio_tungstenite::tungstenite::Error) -> StreamVerdict {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            StreamVerdict::Forbidden
        }
        WsError::Http(resp) if resp.status().as_u16() == 429 => StreamVerdict::RateLimited,
        _ => StreamVerdict::Errored,
    }
}

fn close_verdict(frame: Option<&CloseFrame<'_>>) -> StreamVerdict {
    match frame {
        Some(f)
            if f.code == CloseCode::Policy
                || f.reason.to_ascii_lowercase().contains("rate limit") =>
        {
            StreamVerdict::RateLimited
        }
        _ => StreamVerdict::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use crate::exchange::testutil::ScriptedApi;

    fn stub(delay_ms: u64) -> ScriptedApi {
        ScriptedApi {
            delay: Duration::from_millis(delay_ms),
            ..Default::default()
        }
    }

    fn conn(api: Arc<ScriptedApi>) -> StreamConnection {
        let (tick_tx, _) = broadcast::channel(64);
        // receiver dropped; try_send failures are tolerated
        let (resync_tx, _) = mpsc::channel(8);
        StreamConnection::new(
            api,
            StreamKind::Trades,
            Instrument::new(ExchangeKind::Binance, "BTCUSDT", "BTC", "USDT"),
            Arc::new(MarketTable::default()),
            tick_tx,
            resync_tx,
            None,
        )
    }

    async fn local_server<F>(serve: F) -> String
    where
        F: FnOnce(
                tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
            ) -> futures_util::future::BoxFuture<'static, ()>
            + Send
            + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((sock, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(sock).await {
                    serve(ws).await;
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn frames_dispatch_until_clean_close() {
        let address = local_server(|mut ws| {
            Box::pin(async move {
                ws.send(Message::Text("one".into())).await.unwrap();
                ws.send(Message::Text("two".into())).await.unwrap();
                ws.close(None).await.unwrap();
            })
        })
        .await;

        let api = Arc::new(stub(2_000));
        let c = conn(api.clone());
        let mut attempt = 3;
        let verdict = c.run_once(&address, &mut attempt).await;
        assert_eq!(verdict, StreamVerdict::Disconnected);
        assert_eq!(attempt, 0, "successful connect resets backoff");
        assert_eq!(*api.seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn silence_counts_as_stalled() {
        let address = local_server(|ws| {
            Box::pin(async move {
                // keep the socket open but silent so the liveness timeout fires
                let _keep = ws;
                sleep(Duration::from_secs(5)).await;
            })
        })
        .await;

        let api = Arc::new(stub(100));
        let c = conn(api);
        let mut attempt = 0;
        let verdict = c.run_once(&address, &mut attempt).await;
        assert_eq!(verdict, StreamVerdict::Stalled);
    }

    #[tokio::test]
    async fn policy_close_is_rate_limited() {
        let address = local_server(|mut ws| {
            Box::pin(async move {
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: "rate limit exceeded".into(),
                };
                let _ = ws.send(Message::Close(Some(frame))).await;
            })
        })
        .await;

        let api = Arc::new(stub(2_000));
        let c = conn(api);
        let mut attempt = 0;
        let verdict = c.run_once(&address, &mut attempt).await;
        assert_eq!(verdict, StreamVerdict::RateLimited);
    }

    #[tokio::test]
    async fn authorization_error_is_permanent() {
        let address = local_server(|mut ws| {
            Box::pin(async move {
                let _ = ws.send(Message::Text("denied".into())).await;
                sleep(Duration::from_secs(5)).await;
            })
        })
        .await;

        let mut api = stub(2_000);
        api.fail_auth = true;
        let c = conn(Arc::new(api));
        let mut attempt = 0;
        let verdict = c.run_once(&address, &mut attempt).await;
        assert_eq!(verdict, StreamVerdict::Forbidden);
    }

    #[tokio::test]
    async fn bad_address_is_permanent() {
        let api = Arc::new(stub(100));
        let c = conn(api);
        let mut attempt = 0;
        assert_eq!(
            c.run_once("not a url", &mut attempt).await,
            StreamVerdict::Forbidden
        );
    }

    #[test]
    fn malformed_book_batch_marks_dirty_and_requests_resync() {
        use crate::domain::Market;
        use crate::exchange_bitmex::BitmexExchange;
        use crate::exchange::RestClient;
        use crate::ratelimit::RateLimiter;

        let limiter = RateLimiter::new(ExchangeKind::Bitmex, Duration::from_secs(60), 120);
        let api: Arc<dyn ExchangeApi> = Arc::new(BitmexExchange::new(
            RestClient::new(ExchangeKind::Bitmex, limiter),
            "https://www.bitmex.com",
            "wss://ws.bitmex.com/realtime",
            60,
        ));
        let mut inst = Instrument::new(ExchangeKind::Bitmex, "XBTUSD", "XBT", "USD");
        inst.contract = true;
        let mut table = MarketTable::default();
        table.insert("XBTUSD".into(), Arc::new(Market::new(inst.clone())));
        let markets = Arc::new(table);

        let (tick_tx, _) = broadcast::channel(8);
        let (resync_tx, mut resync_rx) = mpsc::channel(8);
        let c = StreamConnection::new(
            api,
            StreamKind::Book,
            inst,
            markets.clone(),
            tick_tx,
            resync_tx,
            None,
        );

        // second row has no id, so dispatch fails after the first applied
        let raw = r#"{"table":"orderBookL2","action":"partial","data":[
            {"symbol":"XBTUSD","id":1,"side":"Buy","size":5,"price":100.0},
            {"symbol":"XBTUSD","side":"Sell","size":5,"price":101.0}]}"#;
        assert_eq!(c.on_text(raw), None, "a bad frame never ends the session");

        let market = &markets["XBTUSD"];
        assert!(market.book.is_dirty());
        assert_eq!(
            resync_rx.try_recv().unwrap(),
            ResyncRequest { exchange: ExchangeKind::Bitmex, symbol: "XBTUSD".into() }
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        for attempt in 1..=10u32 {
            let ms = backoff_ms(attempt);
            let base = 500u64 * (1 << attempt.min(6));
            assert!(ms >= base && ms <= base + 250, "attempt {attempt}: {ms}");
        }
    }

    #[test]
    fn close_reason_text_also_rate_limits() {
        let frame = CloseFrame { code: CloseCode::Normal, reason: "Rate Limit hit".into() };
        assert_eq!(close_verdict(Some(&frame)), StreamVerdict::RateLimited);
        let frame = CloseFrame { code: CloseCode::Away, reason: "bye".into() };
        assert_eq!(close_verdict(Some(&frame)), StreamVerdict::Disconnected);
        assert_eq!(close_verdict(None), StreamVerdict::Disconnected);
    }
}
