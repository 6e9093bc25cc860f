// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "best bid/ask updates").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "best bid/ask updates per symbol"),
        &["exchange", "symbol"],
    )
    .unwrap()
});

pub static BOOK_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("book_depth_levels", "order book depth per side"),
        &["exchange", "symbol", "side"],
    )
    .unwrap()
});

pub static BOOK_RESYNCS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "book_resyncs_total",
            "order book snapshot refetches after a dirty mark",
        ),
        &["exchange", "symbol"],
    )
    .unwrap()
});

// -------- WebSocket health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("ws_connected", "1 if the stream is connected, 0 otherwise"),
        &["exchange", "stream"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "stream reconnect attempts"),
        &["exchange", "stream"],
    )
    .unwrap()
});

pub static WS_LAST_MESSAGE_TS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "ws_last_message_ts",
            "Unix seconds of the last received stream message",
        ),
        &["exchange", "stream"],
    )
    .unwrap()
});

// -------- REST / rate limiting --------
pub static REST_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rest_requests_total", "REST calls by endpoint and outcome"),
        &["exchange", "endpoint", "outcome"],
    )
    .unwrap()
});

pub static RATE_LIMIT_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "rate_limit_waits_total",
            "times a request had to sleep for budget",
        ),
        &["exchange"],
    )
    .unwrap()
});

// -------- Trading --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders submitted"),
        &["exchange", "side", "outcome"],
    )
    .unwrap()
});

pub static TRAILING_ACTIVE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("trailing_active", "trailing orders not yet done").unwrap());

pub static TRAILING_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "trailing_events_total",
            "trailing state machine events (armed/sold/bought/failed/notified)",
        ),
        &["event"],
    )
    .unwrap()
});

// -------- Capture --------
pub static CAPTURE_EVENTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("capture_events_total", "captured stream messages").unwrap());

// ---- Config visibility (exchanges / symbols / trailing) ----
pub static CONFIG_EXCHANGE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_exchange", "configured exchanges (label: exchange)"),
        &["exchange"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: exchange, symbol)"),
        &["exchange", "symbol"],
    )
    .unwrap()
});

pub static CONFIG_TRAILING: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "config_trailing",
            "configured trailing orders (labels: exchange, symbol, mode)",
        ),
        &["exchange", "symbol", "mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(BOOK_DEPTH.clone())),
        REGISTRY.register(Box::new(BOOK_RESYNCS.clone())),
        // WS health
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_LAST_MESSAGE_TS.clone())),
        // REST / rate limiting
        REGISTRY.register(Box::new(REST_REQUESTS.clone())),
        REGISTRY.register(Box::new(RATE_LIMIT_WAITS.clone())),
        // Trading
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(TRAILING_ACTIVE.clone())),
        REGISTRY.register(Box::new(TRAILING_EVENTS.clone())),
        REGISTRY.register(Box::new(CAPTURE_EVENTS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_EXCHANGE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
        REGISTRY.register(Box::new(CONFIG_TRAILING.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
