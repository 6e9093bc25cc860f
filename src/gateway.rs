// ===============================
// src/gateway.rs
// ===============================
//
// Normalized trading calls over one exchange connector. Translation only:
// no retry, no queueing; every call is a single best-effort attempt whose
// outcome is reported synchronously to the caller.
//
// Outcome logging follows the transient/permanent split: transport and
// rate-limit trouble logs at warn (self-heals), exchange rejections and
// authorization failures log at error (needs an operator).

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::{AccountInfo, Instrument, OrderKind, OrderSide, TradingResult};
use crate::error::ApiError;
use crate::exchange::ExchangeApi;
use crate::metrics::ORDERS;

pub struct TradingGateway {
    api: Arc<dyn ExchangeApi>,
    account: Arc<AccountInfo>,
}

impl TradingGateway {
    pub fn new(api: Arc<dyn ExchangeApi>, account: Arc<AccountInfo>) -> Self {
        Self { api, account }
    }

    pub fn account(&self) -> &Arc<AccountInfo> {
        &self.account
    }

    pub async fn buy_limit(
        &self,
        instrument: &Instrument,
        price: f64,
        amount: f64,
    ) -> Result<TradingResult, ApiError> {
        self.place(instrument, OrderSide::Buy, OrderKind::Limit, price, amount)
            .await
    }

    pub async fn sell_limit(
        &self,
        instrument: &Instrument,
        price: f64,
        amount: f64,
    ) -> Result<TradingResult, ApiError> {
        self.place(instrument, OrderSide::Sell, OrderKind::Limit, price, amount)
            .await
    }

    pub async fn market_buy(
        &self,
        instrument: &Instrument,
        amount: f64,
    ) -> Result<TradingResult, ApiError> {
        self.place(instrument, OrderSide::Buy, OrderKind::Market, 0.0, amount)
            .await
    }

    pub async fn market_sell(
        &self,
        instrument: &Instrument,
        amount: f64,
    ) -> Result<TradingResult, ApiError> {
        self.place(instrument, OrderSide::Sell, OrderKind::Market, 0.0, amount)
            .await
    }

    /// Market order that closes/reduces an open derivative position instead
    /// of opening the opposite one. Spot connectors treat it as a plain
    /// market order.
    pub async fn close_position(
        &self,
        instrument: &Instrument,
        side: OrderSide,
        amount: f64,
    ) -> Result<TradingResult, ApiError> {
        self.place(instrument, side, OrderKind::MarketClose, 0.0, amount)
            .await
    }

    pub async fn cancel(
        &self,
        instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError> {
        let res = self.api.cancel_order(&self.account, instrument, order_id).await;
        self.log_result("cancel", instrument, &res);
        res
    }

    pub async fn order_status(
        &self,
        instrument: &Instrument,
        order_id: &str,
    ) -> Result<TradingResult, ApiError> {
        let res = self.api.order_status(&self.account, instrument, order_id).await;
        self.log_result("status", instrument, &res);
        res
    }

    async fn place(
        &self,
        instrument: &Instrument,
        side: OrderSide,
        kind: OrderKind,
        price: f64,
        amount: f64,
    ) -> Result<TradingResult, ApiError> {
        let res = self
            .api
            .place_order(&self.account, instrument, side, kind, price, amount)
            .await;
        let outcome = match &res {
            Ok(_) => "ok",
            Err(e) if e.is_transient() => "transient",
            Err(_) => "error",
        };
        ORDERS
            .with_label_values(&[self.api.kind().as_str(), side.as_str(), outcome])
            .inc();
        self.log_result("place", instrument, &res);
        res
    }

    fn log_result(
        &self,
        action: &'static str,
        instrument: &Instrument,
        res: &Result<TradingResult, ApiError>,
    ) {
        let exchange = self.api.kind().as_str();
        match res {
            Ok(r) => info!(
                exchange,
                symbol = %instrument.symbol,
                action,
                order_id = %r.order_id,
                side = r.side.as_str(),
                price = r.price,
                amount = r.amount,
                status = %r.status,
                filled = r.filled,
                "trade call ok"
            ),
            Err(e) if e.is_transient() => warn!(
                exchange,
                symbol = %instrument.symbol,
                action,
                %e,
                "trade call failed, will self-heal"
            ),
            Err(e) => error!(
                exchange,
                symbol = %instrument.symbol,
                action,
                %e,
                "trade call failed, needs attention"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExchangeKind;
    use crate::exchange::testutil::ScriptedApi;

    fn gateway(api: Arc<ScriptedApi>) -> TradingGateway {
        let account = Arc::new(AccountInfo::new(ExchangeKind::Binance, "k", "s"));
        TradingGateway::new(api, account)
    }

    fn instrument() -> Instrument {
        Instrument::new(ExchangeKind::Binance, "BTCUSDT", "BTC", "USDT")
    }

    #[tokio::test]
    async fn limit_and_market_calls_translate_to_connector_orders() {
        let api = Arc::new(ScriptedApi::default());
        let gw = gateway(api.clone());
        let inst = instrument();

        gw.buy_limit(&inst, 100.5, 2.0).await.unwrap();
        gw.market_sell(&inst, 0.75).await.unwrap();
        gw.close_position(&inst, OrderSide::Sell, 1.5).await.unwrap();

        let orders = api.orders.lock().unwrap().clone();
        assert_eq!(
            orders,
            vec![
                (OrderSide::Buy, OrderKind::Limit, 100.5, 2.0),
                (OrderSide::Sell, OrderKind::Market, 0.0, 0.75),
                (OrderSide::Sell, OrderKind::MarketClose, 0.0, 1.5),
            ]
        );
    }

    #[tokio::test]
    async fn result_is_normalized_not_reinterpreted() {
        let api = Arc::new(ScriptedApi::default());
        api.push_result(Ok(ScriptedApi::done("BTCUSDT", OrderSide::Sell, 99.0, 3.0)));
        let gw = gateway(api);

        let r = gw.market_sell(&instrument(), 3.0).await.unwrap();
        assert_eq!(r.order_id, "scripted-1");
        assert_eq!(r.side, OrderSide::Sell);
        assert_eq!(r.total, 99.0 * 3.0);
        assert!(r.filled);
    }

    #[tokio::test]
    async fn single_attempt_no_retry_on_failure() {
        let api = Arc::new(ScriptedApi::default());
        api.push_result(Err(ApiError::RateLimit));
        let gw = gateway(api.clone());

        let err = gw.market_sell(&instrument(), 1.0).await.unwrap_err();
        assert!(err.is_transient());
        // exactly one connector call, the gateway never retries
        assert_eq!(api.orders.lock().unwrap().len(), 1);
    }
}
