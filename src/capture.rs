// ===============================
// src/capture.rs
// ===============================
//
// Raw stream capture and replay.
//
// Live sockets tee every text frame into an mpsc channel; one writer task
// appends them to a JSONL file (buffered, flushed every second or every
// 1000 events, reopened once on a failed write). Replay reads the same
// file and pushes each payload back through the owning connector's
// dispatch, rebuilding books and tapes without touching the network.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::{ExchangeKind, MarketTable, StreamKind};
use crate::exchange::{DispatchOutcome, ExchangeRegistry};
use crate::metrics::CAPTURE_EVENTS;

/// One captured stream frame, one JSONL row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub seq: u64,
    pub ts_ms: i64,
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub stream: StreamKind,
    pub payload: String,
}

/// Shared tap handed to every stream task. Sequence numbers are global so
/// a replay preserves cross-stream ordering.
#[derive(Clone)]
pub struct CaptureSink {
    tx: mpsc::Sender<CaptureEvent>,
    seq: Arc<AtomicU64>,
}

impl CaptureSink {
    pub fn new(tx: mpsc::Sender<CaptureEvent>) -> Self {
        Self { tx, seq: Arc::new(AtomicU64::new(0)) }
    }

    /// Non-blocking; a full channel drops the frame rather than stall the
    /// reader loop.
    pub fn record(
        &self,
        exchange: ExchangeKind,
        symbol: &str,
        stream: StreamKind,
        payload: &str,
    ) {
        let ev = CaptureEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ts_ms: chrono::Utc::now().timestamp_millis(),
            exchange,
            symbol: symbol.to_string(),
            stream,
            payload: payload.to_string(),
        };
        if self.tx.try_send(ev).is_err() {
            warn!("capture channel full, dropping frame");
        }
    }
}

async fn open_writer(path: &str) -> BufWriter<File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "capture: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap_or_else(|e| panic!("capture: open {} failed: {}", path, e));
    BufWriter::new(file)
}

/// Writer task. Runs until the channel closes, then flushes and exits.
pub async fn run_recorder(mut rx: mpsc::Receiver<CaptureEvent>, path: String) {
    info!(%path, "capture: started");
    let mut writer = open_writer(&path).await;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => {
                        let mut line = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "capture: serialize error, skip event");
                                continue;
                            }
                        };
                        line.push('\n');

                        // one buffer per event: a failed write reopens and
                        // rewrites the whole line, never a fragment
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(?e, "capture: write failed, reopening");
                            writer = open_writer(&path).await;
                            if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                error!(?e2, "capture: write failed after reopen, drop event");
                                continue;
                            }
                        }

                        CAPTURE_EVENTS.inc();
                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        let _ = writer.flush().await;
                        info!("capture: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: u64,
    pub applied: u64,
    pub ticks: u64,
    pub trades: u64,
    pub resyncs: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Feed a capture file back through the connectors' dispatch. Books marked
/// for resync stay dirty; there is no REST to refetch from during replay.
pub async fn replay_file(
    path: &str,
    registry: &ExchangeRegistry,
    markets: &ahash::AHashMap<ExchangeKind, Arc<MarketTable>>,
) -> std::io::Result<ReplaySummary> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut summary = ReplaySummary::default();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        summary.events += 1;
        let ev: CaptureEvent = match serde_json::from_str(&line) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(?e, line = summary.events, "capture: bad row, skipping");
                summary.errors += 1;
                continue;
            }
        };
        let (Some(api), Some(table)) = (registry.get(ev.exchange), markets.get(&ev.exchange))
        else {
            summary.skipped += 1;
            continue;
        };
        match api.apply_stream_message(ev.stream, table, &ev.payload) {
            Ok(DispatchOutcome::Tickers(t)) => {
                summary.applied += 1;
                summary.ticks += t.len() as u64;
            }
            Ok(DispatchOutcome::BookApplied { .. }) => summary.applied += 1,
            Ok(DispatchOutcome::Trades { appended, .. }) => {
                summary.applied += 1;
                summary.trades += appended as u64;
            }
            Ok(DispatchOutcome::BookNeedsResync { symbol }) => {
                summary.resyncs += 1;
                warn!(exchange = ev.exchange.as_str(), %symbol, seq = ev.seq, "replay: book diverged");
            }
            Ok(DispatchOutcome::Ignored) => summary.skipped += 1,
            Err(e) => {
                summary.errors += 1;
                warn!(?e, seq = ev.seq, "replay: dispatch error");
            }
        }
    }
    Ok(summary)
}
