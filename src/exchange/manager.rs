use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Settings;
use crate::exchange::api::{ExchangeApi, OrderAck};
use crate::exchange::cache::ExchangeCache;
use crate::exchange::error::ExchangeError;
use crate::exchange::guard::{ActiveOrder, PendingOrders};
use crate::models::{Coin, Order, OrderStatus, Side};
use crate::persistence::TradeStore;

/// Asset Binance discounts fees into
pub const FEE_DISCOUNT_COIN: &str = "BNB";

/// Visible attempts at the public buy/sell boundary
const RETRY_ATTEMPTS: u32 = 20;

/// Poll interval while waiting on an order, and delay between transient
/// retries
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fraction of the limit price the market must drop below before a
/// partially filled BUY is considered stale (0.1%)
const BUY_STALE_PRICE_RATIO: f64 = 0.999;

/// Order execution engine.
///
/// Computes fee- and balance-aware order sizes, submits orders with
/// retry-until-ack semantics, and blocks polling the cache until an order
/// reaches a terminal state or the timeout policy cancels it. The cache is
/// concurrently populated by the stream reconciler.
pub struct ExchangeManager {
    api: Arc<dyn ExchangeApi>,
    cache: Arc<ExchangeCache>,
    pending: PendingOrders,
    settings: Settings,
    /// Per-pair quantity precision; lot-size rules do not change at runtime
    tick_cache: Mutex<HashMap<String, i32>>,
    notional_cache: Mutex<HashMap<String, f64>>,
}

impl ExchangeManager {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        cache: Arc<ExchangeCache>,
        pending: PendingOrders,
        settings: Settings,
    ) -> Self {
        Self {
            api,
            cache,
            pending,
            settings,
            tick_cache: Mutex::new(HashMap::new()),
            notional_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ExchangeCache> {
        &self.cache
    }

    /// Check that the configured credentials can reach the API.
    pub async fn test_connection(&self) -> Result<(), ExchangeError> {
        self.api.ping().await?;
        self.api.account_balances().await.map_err(|e| match e {
            ExchangeError::Api { code, message } if message.is_empty() => ExchangeError::Api {
                code,
                message: "Couldn't access the exchange API - keys may be wrong or lack permissions"
                    .to_string(),
            },
            other => other,
        })?;
        Ok(())
    }

    // ========================================================================
    // Cached exchange state
    // ========================================================================

    /// Last known price for a pair symbol. A miss triggers a bulk refresh;
    /// symbols the exchange does not list are remembered and never
    /// re-fetched.
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<Option<f64>, ExchangeError> {
        if let Some(price) = self.cache.ticker_price(symbol) {
            return Ok(Some(price));
        }
        if self.cache.is_missing_ticker(symbol) {
            return Ok(None);
        }

        let prices = self.api.all_ticker_prices().await?;
        tracing::debug!(count = prices.len(), "Ticker prices fetched");
        self.cache.replace_tickers(prices);

        let price = self.cache.ticker_price(symbol);
        if price.is_none() {
            tracing::debug!(symbol = %symbol, "Ticker not found, skipping");
            self.cache.mark_missing_ticker(symbol);
        }

        Ok(price)
    }

    /// Free balance of one asset. A miss (or `force`) clears and
    /// repopulates the whole mapping from the exchange; unknown assets
    /// read as 0.0.
    pub async fn get_balance(&self, asset: &str, force: bool) -> Result<f64, ExchangeError> {
        let mut balances = self.cache.open_balances().await;

        if !force {
            if let Some(balance) = balances.get(asset) {
                return Ok(*balance);
            }
        }

        let fetched = self.api.account_balances().await?;
        balances.clear();
        for entry in fetched {
            balances.insert(entry.asset, entry.free);
        }
        tracing::debug!(assets = balances.len(), "Balances fetched");

        Ok(balances.get(asset).copied().unwrap_or_else(|| {
            balances.insert(asset.to_string(), 0.0);
            0.0
        }))
    }

    // ========================================================================
    // Pair precision and fees
    // ========================================================================

    /// Quantity precision for a pair, derived from the LOT_SIZE step
    /// string. Computed once per pair and cached for the process lifetime.
    pub async fn pair_tick(&self, origin: &Coin, target: &Coin) -> Result<i32, ExchangeError> {
        let symbol = origin.pair_with(&target.symbol);
        if let Some(tick) = self.tick_cache.lock().unwrap().get(&symbol) {
            return Ok(*tick);
        }

        let step = self.api.lot_size_step(&symbol).await?;
        let tick = tick_from_step(&step).ok_or_else(|| {
            ExchangeError::Parse(format!("bad LOT_SIZE step for {}: {:?}", symbol, step))
        })?;

        self.tick_cache.lock().unwrap().insert(symbol, tick);
        Ok(tick)
    }

    /// MIN_NOTIONAL filter for a pair, cached like the tick.
    pub async fn min_notional(&self, origin: &Coin, target: &Coin) -> Result<f64, ExchangeError> {
        let symbol = origin.pair_with(&target.symbol);
        if let Some(value) = self.notional_cache.lock().unwrap().get(&symbol) {
            return Ok(*value);
        }

        let value = self.api.min_notional(&symbol).await?;
        self.notional_cache.lock().unwrap().insert(symbol, value);
        Ok(value)
    }

    /// Effective taker fee for trading the pair. The 25% discount applies
    /// only when the account opts into fee payment in the discount asset
    /// and the cached discount-asset balance covers the estimated fee. A
    /// missing cross-rate falls back to the undiscounted fee.
    pub async fn get_fee(
        &self,
        origin: &Coin,
        target: &Coin,
        selling: bool,
    ) -> Result<f64, ExchangeError> {
        let symbol = origin.pair_with(&target.symbol);
        let fees = self.api.trade_fees().await?;
        let base_fee = *fees
            .get(&symbol)
            .ok_or_else(|| ExchangeError::Parse(format!("no trade fee for {}", symbol)))?;

        if !self.api.using_fee_discount().await? {
            return Ok(base_fee);
        }

        // The discount only applies if we hold enough of the discount
        // asset to cover the fee
        let amount_trading = if selling {
            self.sell_quantity(origin, target, None).await?
        } else {
            self.buy_quantity(origin, target, None, None).await?
        };
        let fee_amount = amount_trading * base_fee * 0.75;

        let fee_amount_discount_asset = if origin.symbol == FEE_DISCOUNT_COIN {
            fee_amount
        } else {
            let cross_symbol = origin.pair_with(FEE_DISCOUNT_COIN);
            match self.get_ticker_price(&cross_symbol).await? {
                Some(rate) => fee_amount * rate,
                None => return Ok(base_fee),
            }
        };

        let discount_balance = self.get_balance(FEE_DISCOUNT_COIN, false).await?;
        if discount_balance >= fee_amount_discount_asset {
            Ok(base_fee * 0.75)
        } else {
            Ok(base_fee)
        }
    }

    // ========================================================================
    // Quantities
    // ========================================================================

    /// How much of `origin` a buy can afford with the target balance at
    /// the given price, floored to the pair's precision.
    pub async fn buy_quantity(
        &self,
        origin: &Coin,
        target: &Coin,
        target_balance: Option<f64>,
        price: Option<f64>,
    ) -> Result<f64, ExchangeError> {
        let target_balance = match target_balance {
            Some(balance) => balance,
            None => self.get_balance(&target.symbol, false).await?,
        };
        let price = match price {
            Some(price) => price,
            None => self
                .get_ticker_price(&origin.pair_with(&target.symbol))
                .await?
                .unwrap_or(1.0),
        };
        let tick = self.pair_tick(origin, target).await?;

        let scale = 10f64.powi(tick);
        Ok((target_balance * scale / price).floor() / scale)
    }

    /// The whole origin balance, floored to the pair's precision.
    pub async fn sell_quantity(
        &self,
        origin: &Coin,
        target: &Coin,
        origin_balance: Option<f64>,
    ) -> Result<f64, ExchangeError> {
        let origin_balance = match origin_balance {
            Some(balance) => balance,
            None => self.get_balance(&origin.symbol, false).await?,
        };
        let tick = self.pair_tick(origin, target).await?;

        let scale = 10f64.powi(tick);
        Ok((origin_balance * scale).floor() / scale)
    }

    // ========================================================================
    // Order execution
    // ========================================================================

    /// Buy `origin` with the full cached `target` balance. Returns the
    /// terminal order record, or `None` when no trade happened.
    pub async fn buy(
        &self,
        origin: &Coin,
        target: &Coin,
        store: &dyn TradeStore,
    ) -> Result<Option<Order>, ExchangeError> {
        self.execute_with_retry(origin, target, store, Side::Buy)
            .await
    }

    /// Sell the full cached `origin` balance into `target`.
    pub async fn sell(
        &self,
        origin: &Coin,
        target: &Coin,
        store: &dyn TradeStore,
    ) -> Result<Option<Order>, ExchangeError> {
        self.execute_with_retry(origin, target, store, Side::Sell)
            .await
    }

    /// Bounded retry wrapper around one execution attempt. Transient
    /// failures are absorbed; exhaustion yields "no trade". Usage
    /// violations and other permanent errors propagate.
    async fn execute_with_retry(
        &self,
        origin: &Coin,
        target: &Coin,
        store: &dyn TradeStore,
        side: Side,
    ) -> Result<Option<Order>, ExchangeError> {
        tokio::time::sleep(POLL_INTERVAL).await;

        for attempt in 0..RETRY_ATTEMPTS {
            let result = match side {
                Side::Buy => self.buy_inner(origin, target, store).await,
                Side::Sell => self.sell_inner(origin, target, store).await,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => {
                    if attempt == 0 {
                        tracing::warn!(error = %e, "Order attempt failed");
                    }
                    tracing::debug!(
                        "Failed to place order, retrying [{}/{}]",
                        attempt,
                        RETRY_ATTEMPTS
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    async fn buy_inner(
        &self,
        origin: &Coin,
        target: &Coin,
        store: &dyn TradeStore,
    ) -> Result<Option<Order>, ExchangeError> {
        let trade_log = store
            .start_trade_log(origin, target, false)
            .await
            .map_err(|e| ExchangeError::Storage(e.to_string()))?;

        // The prior balance view is stale once a new order is planned
        {
            let mut balances = self.cache.open_balances().await;
            balances.clear();
        }

        let origin_balance = self.get_balance(&origin.symbol, false).await?;
        let target_balance = self.get_balance(&target.symbol, false).await?;
        let symbol = origin.pair_with(&target.symbol);

        let Some(price) = self.get_ticker_price(&symbol).await? else {
            return Ok(None);
        };

        let quantity = self
            .buy_quantity(origin, target, Some(target_balance), Some(price))
            .await?;

        tracing::info!(
            symbol = %symbol,
            quantity = format!("{:.8}", quantity),
            total = format!("{:.8}", quantity * price),
            "Placing BUY order"
        );

        // Hold the pending-set mutex from before placement until the order
        // id is registered, so no stream event for it can be missed
        let mut guard = self.pending.acquire().await;
        let ack = self
            .submit_until_acked(|| self.api.order_limit_buy(&symbol, quantity, price))
            .await?;

        trade_log
            .set_ordered(origin_balance, target_balance, quantity)
            .await
            .map_err(|e| ExchangeError::Storage(e.to_string()))?;

        guard.set_order(&symbol, ack.order_id);
        let active = guard.enter()?;

        let Some(order) = self.wait_for_order(origin, target, ack.order_id, active).await? else {
            return Ok(None);
        };

        tracing::info!(
            symbol = %symbol,
            quantity = format!("{:.8}", quantity),
            total = format!("{:.8}", quantity * price),
            "BUY order filled"
        );

        trade_log
            .set_complete(order.cumulative_quote_qty)
            .await
            .map_err(|e| ExchangeError::Storage(e.to_string()))?;

        Ok(Some(order))
    }

    async fn sell_inner(
        &self,
        origin: &Coin,
        target: &Coin,
        store: &dyn TradeStore,
    ) -> Result<Option<Order>, ExchangeError> {
        let trade_log = store
            .start_trade_log(origin, target, true)
            .await
            .map_err(|e| ExchangeError::Storage(e.to_string()))?;

        {
            let mut balances = self.cache.open_balances().await;
            balances.clear();
        }

        let origin_balance = self.get_balance(&origin.symbol, false).await?;
        let target_balance = self.get_balance(&target.symbol, false).await?;
        let symbol = origin.pair_with(&target.symbol);

        let Some(price) = self.get_ticker_price(&symbol).await? else {
            return Ok(None);
        };

        // Sell at the calculated price, never at market, to avoid losing
        // value on a thin book
        let quantity = self
            .sell_quantity(origin, target, Some(origin_balance))
            .await?;

        tracing::info!(
            symbol = %symbol,
            quantity = format!("{:.8}", quantity),
            total = format!("{:.8}", quantity * price),
            "Placing SELL order"
        );

        let mut guard = self.pending.acquire().await;
        let ack = self
            .submit_until_acked(|| self.api.order_limit_sell(&symbol, quantity, price))
            .await?;

        trade_log
            .set_ordered(origin_balance, target_balance, quantity)
            .await
            .map_err(|e| ExchangeError::Storage(e.to_string()))?;

        guard.set_order(&symbol, ack.order_id);
        let active = guard.enter()?;

        let Some(order) = self.wait_for_order(origin, target, ack.order_id, active).await? else {
            return Ok(None);
        };

        // Confirm settlement: force-refresh until the origin balance drops
        let mut new_balance = self.get_balance(&origin.symbol, false).await?;
        while new_balance >= origin_balance {
            new_balance = self.get_balance(&origin.symbol, true).await?;
        }

        tracing::info!(
            symbol = %symbol,
            quantity = format!("{:.8}", quantity),
            total = format!("{:.8}", quantity * price),
            "SELL order filled"
        );

        trade_log
            .set_complete(order.cumulative_quote_qty)
            .await
            .map_err(|e| ExchangeError::Storage(e.to_string()))?;

        Ok(Some(order))
    }

    /// Retry submission until the exchange returns an order id.
    async fn submit_until_acked<F, Fut>(&self, submit: F) -> Result<OrderAck, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<OrderAck, ExchangeError>>,
    {
        loop {
            match submit().await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Order submission failed, retrying");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until the order is terminal or the timeout policy cancels
    /// it. The pending-set entry is released on every exit path.
    async fn wait_for_order(
        &self,
        origin: &Coin,
        target: &Coin,
        order_id: u64,
        active: ActiveOrder,
    ) -> Result<Option<Order>, ExchangeError> {
        let result = self.wait_for_order_inner(origin, target, order_id).await;
        active.release().await;
        result
    }

    async fn wait_for_order_inner(
        &self,
        origin: &Coin,
        target: &Coin,
        order_id: u64,
    ) -> Result<Option<Order>, ExchangeError> {
        let symbol = origin.pair_with(&target.symbol);

        // The reconciler creates the record from the first execution report
        let mut order = loop {
            if let Some(order) = self.cache.order(order_id) {
                break order;
            }
            tracing::debug!(order_id, "Waiting for creation of order");
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        tracing::debug!(order_id, status = ?order.status, "Order created");

        while order.status != OrderStatus::Filled {
            tracing::debug!(order_id, status = ?order.status, "Waiting for fulfillment");

            match self.should_cancel(&order).await {
                Ok(true) => {
                    self.cancel_until_acked(&symbol, order_id).await;
                    tracing::debug!(order_id, "Order timed out, canceled");

                    // A partially filled BUY leaves the position stranded in
                    // the origin asset; sell the acquired quantity back
                    if order.status == OrderStatus::PartiallyFilled && order.side == Side::Buy {
                        tracing::debug!(order_id, "Reselling partially filled amount");
                        let quantity = self.sell_quantity(origin, target, None).await?;
                        self.submit_until_acked(|| self.api.order_market_sell(&symbol, quantity))
                            .await?;
                    }

                    return Ok(None);
                }
                Ok(false) => {}
                Err(e) => {
                    // Transient staleness-check failure; keep waiting
                    tracing::warn!(order_id, error = %e, "Stale-order check failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            }

            if order.status == OrderStatus::Canceled {
                tracing::debug!(order_id, "Order canceled");
                return Ok(None);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
            if let Some(latest) = self.cache.order(order_id) {
                order = latest;
            }
        }

        tracing::debug!(order_id, "Order filled");
        Ok(Some(order))
    }

    async fn cancel_until_acked(&self, symbol: &str, order_id: u64) {
        loop {
            match self.api.cancel_order(symbol, order_id).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(order_id, error = %e, "Cancel failed, retrying");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Timeout policy, evaluated on every poll.
    ///
    /// A SELL past its timeout is always stale. A BUY past its timeout is
    /// stale while NEW; once partially filled it is stale only if the
    /// market has dropped more than 0.1% below the limit price, which
    /// protects against canceling a buy still near its planned price. A
    /// timeout of zero disables the policy for that side.
    async fn should_cancel(&self, order: &Order) -> Result<bool, ExchangeError> {
        let minutes =
            (chrono::Utc::now().timestamp_millis() - order.time) as f64 / 1000.0 / 60.0;
        let timeout = match order.side {
            Side::Sell => self.settings.sell_timeout,
            Side::Buy => self.settings.buy_timeout,
        };

        if timeout == 0.0 || minutes <= timeout {
            return Ok(false);
        }

        match order.status {
            OrderStatus::New => Ok(true),
            OrderStatus::PartiallyFilled => match order.side {
                Side::Sell => Ok(true),
                Side::Buy => {
                    let current = self.get_ticker_price(&order.symbol).await?;
                    match current {
                        Some(price) => Ok(price < order.price * BUY_STALE_PRICE_RATIO),
                        None => Ok(false),
                    }
                }
            },
            _ => Ok(false),
        }
    }

    // ========================================================================
    // Collation
    // ========================================================================

    /// Total value of the given assets expressed in `target_symbol`,
    /// trying both rate directions and skipping assets with no ticker
    /// either way.
    pub async fn collate_balances(
        &self,
        target_symbol: &str,
        symbols: &[String],
    ) -> Result<f64, ExchangeError> {
        let mut total = 0.0;

        for symbol in symbols {
            let balance = self.get_balance(symbol, false).await?;

            if symbol == target_symbol {
                total += balance;
                continue;
            }

            if let Some(price) = self
                .get_ticker_price(&format!("{}{}", target_symbol, symbol))
                .await?
            {
                total += balance / price;
                continue;
            }

            if let Some(price) = self
                .get_ticker_price(&format!("{}{}", symbol, target_symbol))
                .await?
            {
                total += balance * price;
                continue;
            }
        }

        Ok(total)
    }
}

/// Precision from a LOT_SIZE step string, e.g. "0.00100000" -> 3,
/// "1.00000000" -> 0.
fn tick_from_step(step: &str) -> Option<i32> {
    let one = step.find('1')?;
    if one == 0 {
        let dot = step.find('.')?;
        Some(1 - dot as i32)
    } else {
        Some(one as i32 - 1)
    }
}
