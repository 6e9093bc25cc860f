// ===============================
// src/trailing.rs
// ===============================
//
// Trailing stop-loss / take-profit engine.
//
// `TrailingSettings` is the state machine: Analyze -> TakeProfit -> Done,
// stepped with one best bid/ask pair at a time and free of I/O, so every
// transition is unit-testable. The driver task feeds it from the tick bus
// and turns emitted steps into gateway calls / notifications.
//
// Sell trailing: ratchet the max observed bid; sell once the bid falls
// below the stop-loss trigger, or switch to TakeProfit once the bid clears
// the profit-start threshold and trail the peak from there. Buy trailing is
// the mirror on the ask with a min-price ratchet and no TakeProfit phase.
//
// A failed execute-mode order leaves the state unchanged, so the trigger
// re-fires on the next tick.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::domain::{ExchangeKind, Instrument, OrderSide, TickEvent};
use crate::gateway::TradingGateway;
use crate::metrics::{TRAILING_ACTIVE, TRAILING_EVENTS};

/// Where a triggered action goes: to the exchange or only to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingMode {
    Execute,
    Notify,
}

impl TrailingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrailingMode::Execute => "execute",
            TrailingMode::Notify => "notify",
        }
    }

    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "execute" => Some(TrailingMode::Execute),
            "notify" => Some(TrailingMode::Notify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingKind {
    Sell,
    Buy,
}

impl TrailingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrailingKind::Sell => "sell",
            TrailingKind::Buy => "buy",
        }
    }

    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sell" => Some(TrailingKind::Sell),
            "buy" => Some(TrailingKind::Buy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingState {
    Analyze,
    TakeProfit,
    Done,
}

/// What one evaluation tick asks the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingStep {
    /// Price fell through the active sell trigger.
    SellTriggered,
    /// Price rose through the buy trigger (buy trailing).
    BuyTriggered,
    /// Profit-start threshold cleared; now trailing the peak.
    TakeProfitArmed,
}

/// Outbound operator notifications. Delivery (Telegram, mail, ...) is an
/// external collaborator; the default just logs.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!(target: "notify", "{message}");
    }
}

/// Per-instrument trailing configuration plus run state.
#[derive(Debug, Clone)]
pub struct TrailingSettings {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub mode: TrailingMode,
    pub kind: TrailingKind,
    pub buy_price: f64,
    pub amount: f64,
    pub stop_loss_percent: f64,
    pub take_profit_start_percent: f64,
    pub take_profit_percent: f64,
    pub ignore_stop_loss: bool,
    pub incremental_stop_loss: bool,
    state: TrailingState,
    actual_price: f64,
    max_price: f64,
    min_price: f64,
}

impl TrailingSettings {
    pub fn new(
        exchange: ExchangeKind,
        symbol: impl Into<String>,
        kind: TrailingKind,
        mode: TrailingMode,
        buy_price: f64,
        amount: f64,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            mode,
            kind,
            buy_price,
            amount,
            stop_loss_percent: 10.0,
            take_profit_start_percent: 20.0,
            take_profit_percent: 5.0,
            ignore_stop_loss: false,
            incremental_stop_loss: false,
            state: TrailingState::Analyze,
            actual_price: 0.0,
            max_price: 0.0,
            min_price: f64::INFINITY,
        }
    }

    pub fn state(&self) -> TrailingState {
        self.state
    }

    pub fn actual_price(&self) -> f64 {
        self.actual_price
    }

    pub fn max_price(&self) -> f64 {
        self.max_price
    }

    pub fn mark_done(&mut self) {
        self.state = TrailingState::Done;
    }

    /// Price below which a sell fires. Pure: unchanged state gives the same
    /// value on every call. `None` means the trigger is unreachable
    /// (stop-loss explicitly ignored while still analyzing).
    pub fn sell_trigger(&self) -> Option<f64> {
        if self.state == TrailingState::TakeProfit {
            return Some(self.max_price * (100.0 - self.take_profit_percent) / 100.0);
        }
        if self.ignore_stop_loss {
            return None;
        }
        let basis = if self.incremental_stop_loss {
            self.max_price
        } else {
            self.buy_price
        };
        Some(basis * (100.0 - self.stop_loss_percent) / 100.0)
    }

    /// Price above which a buy fires (buy trailing), mirrored from
    /// [`Self::sell_trigger`] around the min-price ratchet.
    pub fn buy_trigger(&self) -> Option<f64> {
        if self.ignore_stop_loss {
            return None;
        }
        let basis = if self.incremental_stop_loss && self.min_price.is_finite() {
            self.min_price
        } else {
            self.buy_price
        };
        Some(basis * (100.0 + self.stop_loss_percent) / 100.0)
    }

    pub fn take_profit_start_price(&self) -> f64 {
        self.buy_price * (100.0 + self.take_profit_start_percent) / 100.0
    }

    /// One evaluation tick. Re-evaluates unconditionally while non-terminal;
    /// `Done` is terminal and ignores further ticks.
    pub fn on_tick(&mut self, best_bid: f64, best_ask: f64) -> Option<TrailingStep> {
        if self.state == TrailingState::Done {
            return None;
        }
        match self.kind {
            TrailingKind::Sell => self.analyze_sell(best_bid),
            TrailingKind::Buy => self.analyze_buy(best_ask),
        }
    }

    fn analyze_sell(&mut self, best_bid: f64) -> Option<TrailingStep> {
        if !(best_bid.is_finite() && best_bid > 0.0) {
            return None;
        }
        self.actual_price = best_bid;
        self.max_price = self.max_price.max(best_bid);

        if let Some(trigger) = self.sell_trigger() {
            if self.actual_price < trigger {
                return Some(TrailingStep::SellTriggered);
            }
        }
        if self.state == TrailingState::Analyze
            && self.actual_price >= self.take_profit_start_price()
        {
            self.state = TrailingState::TakeProfit;
            return Some(TrailingStep::TakeProfitArmed);
        }
        None
    }

    fn analyze_buy(&mut self, best_ask: f64) -> Option<TrailingStep> {
        if !(best_ask.is_finite() && best_ask > 0.0) {
            return None;
        }
        self.actual_price = best_ask;
        self.min_price = self.min_price.min(best_ask);

        if let Some(trigger) = self.buy_trigger() {
            if self.actual_price > trigger {
                return Some(TrailingStep::BuyTriggered);
            }
        }
        None
    }
}

/// Task tying one `TrailingSettings` to the tick bus and the gateway.
pub struct TrailingDriver {
    settings: TrailingSettings,
    instrument: Instrument,
    gateway: TradingGateway,
    notifier: Arc<dyn Notifier>,
}

impl TrailingDriver {
    pub fn new(
        settings: TrailingSettings,
        instrument: Instrument,
        gateway: TradingGateway,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { settings, instrument, gateway, notifier }
    }

    pub async fn run(mut self, mut ticks: broadcast::Receiver<TickEvent>) {
        TRAILING_ACTIVE.inc();
        info!(
            exchange = self.settings.exchange.as_str(),
            symbol = %self.settings.symbol,
            kind = self.settings.kind.as_str(),
            mode = self.settings.mode.as_str(),
            buy_price = self.settings.buy_price,
            amount = self.settings.amount,
            "trailing started"
        );
        loop {
            let ev = match ticks.recv().await {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // ratchets only need the latest price, skipping is safe
                    warn!(missed, "trailing tick bus lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if ev.exchange != self.settings.exchange || ev.symbol != self.settings.symbol {
                continue;
            }
            if self.step(ev.best_bid, ev.best_ask).await {
                break;
            }
        }
        TRAILING_ACTIVE.dec();
        info!(
            exchange = self.settings.exchange.as_str(),
            symbol = %self.settings.symbol,
            "trailing stopped"
        );
    }

    /// Returns true when the strategy reached its terminal state.
    async fn step(&mut self, best_bid: f64, best_ask: f64) -> bool {
        match self.settings.on_tick(best_bid, best_ask) {
            Some(TrailingStep::TakeProfitArmed) => {
                TRAILING_EVENTS.with_label_values(&["armed"]).inc();
                info!(
                    symbol = %self.settings.symbol,
                    price = self.settings.actual_price(),
                    max_price = self.settings.max_price(),
                    "take-profit armed"
                );
                if self.settings.mode == TrailingMode::Notify {
                    self.notifier.notify(&format!(
                        "{} - {} - Start TAKEPROFIT",
                        self.settings.exchange.as_str(),
                        self.settings.symbol
                    ));
                }
                false
            }
            Some(TrailingStep::SellTriggered) => self.execute(OrderSide::Sell).await,
            Some(TrailingStep::BuyTriggered) => self.execute(OrderSide::Buy).await,
            None => self.settings.state() == TrailingState::Done,
        }
    }

    async fn execute(&mut self, side: OrderSide) -> bool {
        let exchange = self.settings.exchange.as_str();
        let symbol = self.settings.symbol.clone();

        if self.settings.mode == TrailingMode::Notify {
            TRAILING_EVENTS.with_label_values(&["notified"]).inc();
            self.notifier
                .notify(&format!("{exchange} - {symbol} - {}!!", side.as_str()));
            self.settings.mark_done();
            return true;
        }

        let res = match side {
            OrderSide::Sell => {
                self.gateway
                    .market_sell(&self.instrument, self.settings.amount)
                    .await
            }
            OrderSide::Buy => {
                self.gateway
                    .market_buy(&self.instrument, self.settings.amount)
                    .await
            }
        };
        match res {
            Ok(result) => {
                let event = match side {
                    OrderSide::Sell => "sold",
                    OrderSide::Buy => "bought",
                };
                TRAILING_EVENTS.with_label_values(&[event]).inc();
                info!(
                    exchange,
                    %symbol,
                    order_id = %result.order_id,
                    price = result.price,
                    amount = result.amount,
                    "trailing order placed"
                );
                self.settings.mark_done();
                true
            }
            Err(e) => {
                // state untouched: the trigger re-fires on the next tick
                TRAILING_EVENTS.with_label_values(&["failed"]).inc();
                error!(exchange, %symbol, %e, "trailing order failed");
                self.notifier.notify(&format!(
                    "{exchange}. Error!! Can't {} {symbol}",
                    side.as_str()
                ));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AccountInfo;
    use crate::error::ApiError;
    use crate::exchange::testutil::ScriptedApi;
    use std::sync::Mutex;

    fn sell_settings(mode: TrailingMode) -> TrailingSettings {
        TrailingSettings::new(
            ExchangeKind::Binance,
            "BTCUSDT",
            TrailingKind::Sell,
            mode,
            100.0,
            2.0,
        )
    }

    struct RecNotifier(Mutex<Vec<String>>);

    impl RecNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }
        fn messages(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Notifier for RecNotifier {
        fn notify(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn driver(
        settings: TrailingSettings,
        api: Arc<ScriptedApi>,
        notifier: Arc<RecNotifier>,
    ) -> TrailingDriver {
        let account = Arc::new(AccountInfo::new(ExchangeKind::Binance, "k", "s"));
        let instrument = Instrument::new(ExchangeKind::Binance, "BTCUSDT", "BTC", "USDT");
        TrailingDriver::new(settings, instrument, TradingGateway::new(api, account), notifier)
    }

    #[test]
    fn stop_loss_fires_below_trigger_not_above() {
        // buy 100, stop loss 10% -> trigger 90
        let mut s = sell_settings(TrailingMode::Notify);
        assert_eq!(s.sell_trigger(), Some(90.0));

        assert_eq!(s.on_tick(95.0, 95.1), None);
        assert_eq!(s.state(), TrailingState::Analyze);
        assert_eq!(s.on_tick(89.0, 89.1), Some(TrailingStep::SellTriggered));
    }

    #[test]
    fn trigger_is_idempotent_for_unchanged_state() {
        let mut s = sell_settings(TrailingMode::Notify);
        s.on_tick(95.0, 95.1);
        assert_eq!(s.sell_trigger(), s.sell_trigger());
        let first = s.sell_trigger();
        // a tick that moves nothing leaves the trigger where it was
        s.on_tick(95.0, 95.1);
        assert_eq!(s.sell_trigger(), first);
    }

    #[test]
    fn take_profit_arms_then_trails_the_peak() {
        // buy 100, start 20%, take profit 5%
        let mut s = sell_settings(TrailingMode::Notify);

        assert_eq!(s.on_tick(121.0, 121.1), Some(TrailingStep::TakeProfitArmed));
        assert_eq!(s.state(), TrailingState::TakeProfit);
        assert_eq!(s.max_price(), 121.0);
        assert_eq!(s.sell_trigger(), Some(121.0 * (100.0 - 5.0) / 100.0));

        // 114 < 114.95 -> sell
        assert_eq!(s.on_tick(114.0, 114.1), Some(TrailingStep::SellTriggered));
    }

    #[test]
    fn take_profit_trigger_ratchets_with_new_highs() {
        let mut s = sell_settings(TrailingMode::Notify);
        s.on_tick(121.0, 121.1);
        assert_eq!(s.on_tick(140.0, 140.1), None);
        assert_eq!(s.sell_trigger(), Some(140.0 * 0.95));
        // arming happens once, no second TakeProfitArmed
        assert_eq!(s.on_tick(150.0, 150.1), None);
    }

    #[test]
    fn incremental_stop_loss_follows_the_max() {
        let mut s = sell_settings(TrailingMode::Notify);
        s.incremental_stop_loss = true;
        s.on_tick(110.0, 110.1);
        assert_eq!(s.sell_trigger(), Some(110.0 * 0.9));
        // 100 > 99 keeps analyzing, 98 < 99 fires
        assert_eq!(s.on_tick(100.0, 100.1), None);
        assert_eq!(s.on_tick(98.0, 98.1), Some(TrailingStep::SellTriggered));
    }

    #[test]
    fn ignored_stop_loss_never_sells_but_still_arms() {
        let mut s = sell_settings(TrailingMode::Notify);
        s.ignore_stop_loss = true;
        assert_eq!(s.sell_trigger(), None);
        assert_eq!(s.on_tick(50.0, 50.1), None);
        assert_eq!(s.on_tick(121.0, 121.1), Some(TrailingStep::TakeProfitArmed));
        // armed: the take-profit trigger applies regardless of the flag
        assert_eq!(s.sell_trigger(), Some(121.0 * (100.0 - 5.0) / 100.0));
    }

    #[test]
    fn done_is_terminal() {
        let mut s = sell_settings(TrailingMode::Notify);
        s.mark_done();
        assert_eq!(s.on_tick(1.0, 1.1), None);
        assert_eq!(s.on_tick(500.0, 500.1), None);
        assert_eq!(s.state(), TrailingState::Done);
    }

    #[test]
    fn buy_trailing_mirrors_sell() {
        let mut s = TrailingSettings::new(
            ExchangeKind::Binance,
            "BTCUSDT",
            TrailingKind::Buy,
            TrailingMode::Notify,
            100.0,
            1.0,
        );
        s.incremental_stop_loss = true;
        // falling asks ratchet the min down
        assert_eq!(s.on_tick(99.9, 100.0), None);
        assert_eq!(s.on_tick(89.9, 90.0), None);
        assert_eq!(s.buy_trigger(), Some(90.0 * (100.0 + 10.0) / 100.0));
        // rebound above min * 110% -> buy
        assert_eq!(s.on_tick(99.4, 99.5), Some(TrailingStep::BuyTriggered));
    }

    #[tokio::test]
    async fn notify_mode_notifies_and_finishes_without_trading() {
        let api = Arc::new(ScriptedApi::default());
        let notifier = RecNotifier::new();
        let mut d = driver(sell_settings(TrailingMode::Notify), api.clone(), notifier.clone());

        assert!(!d.step(95.0, 95.1).await);
        assert!(d.step(89.0, 89.1).await);
        assert_eq!(d.settings.state(), TrailingState::Done);
        assert_eq!(notifier.messages(), vec!["binance - BTCUSDT - sell!!"]);
        assert!(api.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_mode_sells_through_the_gateway() {
        let api = Arc::new(ScriptedApi::default());
        let notifier = RecNotifier::new();
        let mut d = driver(sell_settings(TrailingMode::Execute), api.clone(), notifier.clone());

        assert!(d.step(89.0, 89.1).await);
        let orders = api.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        let (side, kind, _price, amount) = orders[0];
        assert_eq!(side, OrderSide::Sell);
        assert_eq!(kind, crate::domain::OrderKind::Market);
        assert_eq!(amount, 2.0);
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn failed_order_keeps_state_and_retries_next_tick() {
        let api = Arc::new(ScriptedApi::default());
        api.push_result(Err(ApiError::RateLimit));
        let notifier = RecNotifier::new();
        let mut d = driver(sell_settings(TrailingMode::Execute), api.clone(), notifier.clone());

        assert!(!d.step(89.0, 89.1).await);
        assert_eq!(d.settings.state(), TrailingState::Analyze);
        assert_eq!(
            notifier.messages(),
            vec!["binance. Error!! Can't sell BTCUSDT"]
        );

        // next tick: trigger still armed, second attempt succeeds
        assert!(d.step(89.0, 89.1).await);
        assert_eq!(d.settings.state(), TrailingState::Done);
        assert_eq!(api.orders.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn armed_notification_sent_in_notify_mode_only() {
        let api = Arc::new(ScriptedApi::default());
        let notifier = RecNotifier::new();
        let mut d = driver(sell_settings(TrailingMode::Notify), api.clone(), notifier.clone());
        assert!(!d.step(121.0, 121.1).await);
        assert_eq!(
            notifier.messages(),
            vec!["binance - BTCUSDT - Start TAKEPROFIT"]
        );

        let notifier2 = RecNotifier::new();
        let mut d2 = driver(sell_settings(TrailingMode::Execute), api, notifier2.clone());
        assert!(!d2.step(121.0, 121.1).await);
        assert!(notifier2.messages().is_empty());
    }
}
