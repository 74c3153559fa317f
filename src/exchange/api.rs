use std::collections::HashMap;

use async_trait::async_trait;

use crate::exchange::error::ExchangeError;
use crate::models::{AssetBalance, Order};

/// Acknowledgement returned when an order is accepted by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: u64,
    pub symbol: String,
}

/// Synchronous request interface to the exchange.
///
/// The live implementation is [`super::rest::BinanceRest`]; tests provide
/// scripted implementations.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Connectivity check
    async fn ping(&self) -> Result<(), ExchangeError>;

    /// Free balances for every asset on the account
    async fn account_balances(&self) -> Result<Vec<AssetBalance>, ExchangeError>;

    /// Last price for every listed symbol (bulk snapshot)
    async fn all_ticker_prices(&self) -> Result<HashMap<String, f64>, ExchangeError>;

    /// Raw LOT_SIZE step string for a symbol (e.g. "0.00100000")
    async fn lot_size_step(&self, symbol: &str) -> Result<String, ExchangeError>;

    /// MIN_NOTIONAL filter value for a symbol
    async fn min_notional(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Taker commission per symbol
    async fn trade_fees(&self) -> Result<HashMap<String, f64>, ExchangeError>;

    /// Whether the account pays fees in the platform's discount asset
    async fn using_fee_discount(&self) -> Result<bool, ExchangeError>;

    async fn order_limit_buy(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn order_limit_sell(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn order_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError>;

    /// Current status of an order, translated into the same record shape
    /// the push stream produces
    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError>;
}
