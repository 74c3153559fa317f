use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::models::Order;

/// Thread-safe in-memory view of exchange state.
///
/// Tickers, the missing-ticker set and the order map use short critical
/// sections and a blocking mutex. Balances and starting balances are
/// mutated in multi-step scoped blocks that may span awaits, so they sit
/// behind async mutexes; callers get exclusive access for the duration of
/// the returned guard and must not retain the mapping beyond it.
#[derive(Default)]
pub struct ExchangeCache {
    tickers: Mutex<HashMap<String, f64>>,
    /// Symbols the exchange does not list; membership lasts for the
    /// process lifetime and prevents refresh storms
    missing_tickers: Mutex<HashSet<String>>,
    orders: Mutex<HashMap<u64, Order>>,
    balances: AsyncMutex<HashMap<String, f64>>,
    starting_balances: AsyncMutex<HashMap<String, f64>>,
}

impl ExchangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticker_price(&self, symbol: &str) -> Option<f64> {
        self.tickers.lock().unwrap().get(symbol).copied()
    }

    pub fn set_ticker(&self, symbol: &str, price: f64) {
        self.tickers.lock().unwrap().insert(symbol.to_string(), price);
    }

    /// Bulk overwrite from a full ticker snapshot
    pub fn replace_tickers(&self, prices: HashMap<String, f64>) {
        *self.tickers.lock().unwrap() = prices;
    }

    pub fn is_missing_ticker(&self, symbol: &str) -> bool {
        self.missing_tickers.lock().unwrap().contains(symbol)
    }

    pub fn mark_missing_ticker(&self, symbol: &str) {
        self.missing_tickers
            .lock()
            .unwrap()
            .insert(symbol.to_string());
    }

    pub fn order(&self, order_id: u64) -> Option<Order> {
        self.orders.lock().unwrap().get(&order_id).cloned()
    }

    /// Upsert by order id; records advance in place and are never deleted
    pub fn record_order(&self, order: Order) {
        self.orders.lock().unwrap().insert(order.id, order);
    }

    /// Exclusive access to the balance mapping for atomic multi-step
    /// mutation (clear-then-repopulate). Released on every exit path.
    pub async fn open_balances(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.balances.lock().await
    }

    /// Exclusive access to the one-time starting-balance snapshot
    pub async fn starting_balances(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.starting_balances.lock().await
    }
}
