use serde::{Deserialize, Serialize};

/// A single asset known to the trader (e.g. "BTC", "USDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub symbol: String,
}

impl Coin {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
        }
    }

    /// Trading-pair symbol for this coin quoted in `target`
    /// (Binance style concatenation, e.g. "ETH" + "USDT" -> "ETHUSDT")
    pub fn pair_with(&self, target: &str) -> String {
        format!("{}{}", self.symbol, target)
    }
}

impl std::fmt::Display for Coin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

/// Order side as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Exchange-defined order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

/// One tracked exchange order, built either from a push execution report
/// or from a REST order-status response after a stream gap. Both paths
/// must produce identical records for the same underlying order state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: String,
    pub cumulative_quote_qty: f64,
    pub status: OrderStatus,
    pub price: f64,
    /// Exchange transaction time, epoch milliseconds
    pub time: i64,
}

/// Free balance of one asset as reported by the account endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
}

/// Logical stream channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChannel {
    /// Public market mini-ticker stream
    MiniTicker,
    /// Authenticated user-data stream (orders, balances)
    UserData,
}

/// Connection lifecycle signal for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    Connect(StreamChannel),
    Disconnect(StreamChannel),
}

/// One mini-ticker tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickerTick {
    pub symbol: String,
    pub close_price: f64,
}

/// Business event delivered by the push stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ExecutionReport(Order),
    /// One asset's balance changed; the cached entry becomes stale
    BalanceUpdate { asset: String },
    /// Full account snapshot replacing the balance cache wholesale
    AccountSnapshot { balances: Vec<AssetBalance> },
    /// Batch of ticker updates
    MiniTickers(Vec<TickerTick>),
    /// Anything we do not understand; reported, never fatal
    Unknown { event_type: String },
}
