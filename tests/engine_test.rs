use altrader::config::Settings;
use altrader::exchange::{
    ExchangeApi, ExchangeCache, ExchangeError, ExchangeManager, OrderAck, PendingOrders,
    StreamReconciler,
};
use altrader::models::{
    AssetBalance, Coin, Order, OrderStatus, Side, StreamChannel, StreamEvent, StreamSignal,
};
use altrader::persistence::NullTradeStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Execution report the fake exchange pushes onto the stream when an
/// order is placed.
#[derive(Clone)]
struct ScriptedFill {
    status: OrderStatus,
    cumulative_quote_qty: f64,
    age_minutes: f64,
}

/// Exchange backend that mimics the push pipeline: placing an order emits
/// an execution report into the data channel, exactly as the real user
/// data stream would.
struct FakeExchange {
    data_tx: mpsc::Sender<StreamEvent>,
    balances: Mutex<HashMap<String, f64>>,
    tickers: Mutex<HashMap<String, f64>>,
    buy_fill: Mutex<Option<ScriptedFill>>,
    sell_fill: Mutex<Option<ScriptedFill>>,
    status_response: Mutex<Option<(OrderStatus, f64)>>,
    status_fetches: AtomicUsize,
    canceled: Mutex<Vec<u64>>,
    next_id: AtomicU64,
    /// Remaining account fetches that fail with a transient API error
    balance_failures: AtomicUsize,
    balance_calls: AtomicUsize,
    /// Remaining order placements that fail with a transient API error
    buy_rejections: AtomicUsize,
    buy_calls: AtomicUsize,
}

impl FakeExchange {
    fn new(data_tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            data_tx,
            balances: Mutex::new(HashMap::new()),
            tickers: Mutex::new(HashMap::new()),
            buy_fill: Mutex::new(None),
            sell_fill: Mutex::new(None),
            status_response: Mutex::new(None),
            status_fetches: AtomicUsize::new(0),
            canceled: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(100),
            balance_failures: AtomicUsize::new(0),
            balance_calls: AtomicUsize::new(0),
            buy_rejections: AtomicUsize::new(0),
            buy_calls: AtomicUsize::new(0),
        }
    }

    fn set_balance(&self, asset: &str, free: f64) {
        self.balances
            .lock()
            .unwrap()
            .insert(asset.to_string(), free);
    }

    fn set_ticker(&self, symbol: &str, price: f64) {
        self.tickers
            .lock()
            .unwrap()
            .insert(symbol.to_string(), price);
    }

    fn make_order(
        &self,
        id: u64,
        symbol: &str,
        side: Side,
        price: f64,
        fill: &ScriptedFill,
    ) -> Order {
        Order {
            id,
            symbol: symbol.to_string(),
            side,
            order_type: "LIMIT".to_string(),
            cumulative_quote_qty: fill.cumulative_quote_qty,
            status: fill.status,
            price,
            time: chrono::Utc::now().timestamp_millis() - (fill.age_minutes * 60_000.0) as i64,
        }
    }

    async fn emit_for_placement(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        fill: Option<ScriptedFill>,
    ) -> OrderAck {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Some(fill) = fill {
            let order = self.make_order(id, symbol, side, price, &fill);
            self.data_tx
                .send(StreamEvent::ExecutionReport(order))
                .await
                .unwrap();
        }
        OrderAck {
            order_id: id,
            symbol: symbol.to_string(),
        }
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn ping(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn account_balances(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if self.balance_failures.load(Ordering::SeqCst) > 0 {
            self.balance_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ExchangeError::Api {
                code: -1003,
                message: "Too much request weight used".to_string(),
            });
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .iter()
            .map(|(asset, free)| AssetBalance {
                asset: asset.clone(),
                free: *free,
            })
            .collect())
    }

    async fn all_ticker_prices(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self.tickers.lock().unwrap().clone())
    }

    async fn lot_size_step(&self, _symbol: &str) -> Result<String, ExchangeError> {
        Ok("0.00001000".to_string())
    }

    async fn min_notional(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        Ok(10.0)
    }

    async fn trade_fees(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let mut fees = HashMap::new();
        fees.insert("BTCUSDT".to_string(), 0.00075);
        Ok(fees)
    }

    async fn using_fee_discount(&self) -> Result<bool, ExchangeError> {
        Ok(false)
    }

    async fn order_limit_buy(
        &self,
        symbol: &str,
        _quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.buy_calls.fetch_add(1, Ordering::SeqCst);
        if self.buy_rejections.load(Ordering::SeqCst) > 0 {
            self.buy_rejections.fetch_sub(1, Ordering::SeqCst);
            return Err(ExchangeError::Api {
                code: -1001,
                message: "Internal error; unable to process your request".to_string(),
            });
        }
        let fill = self.buy_fill.lock().unwrap().clone();
        Ok(self.emit_for_placement(symbol, Side::Buy, price, fill).await)
    }

    async fn order_limit_sell(
        &self,
        symbol: &str,
        _quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let fill = self.sell_fill.lock().unwrap().clone();
        Ok(self
            .emit_for_placement(symbol, Side::Sell, price, fill)
            .await)
    }

    async fn order_market_sell(
        &self,
        symbol: &str,
        _quantity: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            order_id: id,
            symbol: symbol.to_string(),
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        self.canceled.lock().unwrap().push(order_id);
        Ok(())
    }

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError> {
        self.status_fetches.fetch_add(1, Ordering::SeqCst);
        let (status, cumulative_quote_qty) =
            self.status_response.lock().unwrap().ok_or(ExchangeError::Api {
                code: -2013,
                message: "Order does not exist".to_string(),
            })?;
        let fill = ScriptedFill {
            status,
            cumulative_quote_qty,
            age_minutes: 0.0,
        };
        Ok(self.make_order(order_id, symbol, Side::Buy, 0.0, &fill))
    }
}

struct Harness {
    api: Arc<FakeExchange>,
    manager: Arc<ExchangeManager>,
    pending: PendingOrders,
    signal_tx: mpsc::Sender<StreamSignal>,
}

fn build_harness(settings: Settings) -> Harness {
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let (data_tx, data_rx) = mpsc::channel(64);

    let api = Arc::new(FakeExchange::new(data_tx));
    let cache = Arc::new(ExchangeCache::new());
    let pending = PendingOrders::new();

    let reconciler = StreamReconciler::new(
        cache.clone(),
        api.clone(),
        pending.clone(),
        signal_rx,
        data_rx,
    );
    tokio::spawn(reconciler.run());

    let manager = Arc::new(ExchangeManager::new(
        api.clone(),
        cache,
        pending.clone(),
        settings,
    ));

    Harness {
        api,
        manager,
        pending,
        signal_tx,
    }
}

#[tokio::test(start_paused = true)]
async fn test_buy_fills_through_stream_pipeline() {
    let _ = tracing_subscriber::fmt::try_init();

    let h = build_harness(Settings::default());
    h.api.set_balance("USDT", 100.0);
    h.api.set_ticker("BTCUSDT", 50000.0);
    *h.api.buy_fill.lock().unwrap() = Some(ScriptedFill {
        status: OrderStatus::Filled,
        cumulative_quote_qty: 99.95,
        age_minutes: 0.0,
    });

    let order = h
        .manager
        .buy(&Coin::new("BTC"), &Coin::new("USDT"), &NullTradeStore)
        .await
        .unwrap()
        .expect("buy should fill");

    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.side, Side::Buy);
    assert_eq!(order.cumulative_quote_qty, 99.95);
    assert!(h.pending.is_empty().await, "pending entry must be released");
}

#[tokio::test(start_paused = true)]
async fn test_zero_balance_buy_fills_trivially() {
    let h = build_harness(Settings::default());
    h.api.set_balance("USDT", 0.0);
    h.api.set_ticker("BTCUSDT", 50000.0);
    *h.api.buy_fill.lock().unwrap() = Some(ScriptedFill {
        status: OrderStatus::Filled,
        cumulative_quote_qty: 0.0,
        age_minutes: 0.0,
    });

    let order = h
        .manager
        .buy(&Coin::new("BTC"), &Coin::new("USDT"), &NullTradeStore)
        .await
        .unwrap()
        .expect("degenerate buy still reaches FILLED");

    assert_eq!(order.cumulative_quote_qty, 0.0);
    assert!(h.pending.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_missing_ticker_aborts_without_order() {
    let h = build_harness(Settings::default());
    h.api.set_balance("USDT", 100.0);
    // No BTCUSDT ticker at all

    let result = h
        .manager
        .buy(&Coin::new("BTC"), &Coin::new("USDT"), &NullTradeStore)
        .await
        .unwrap();

    assert!(result.is_none());
    assert!(h.pending.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_sell_is_canceled() {
    let settings = Settings {
        sell_timeout: 10.0,
        ..Default::default()
    };
    let h = build_harness(settings);
    h.api.set_balance("BTC", 1.0);
    h.api.set_balance("USDT", 0.0);
    h.api.set_ticker("BTCUSDT", 50000.0);
    // The order arrives already 11 minutes old and never progresses
    *h.api.sell_fill.lock().unwrap() = Some(ScriptedFill {
        status: OrderStatus::New,
        cumulative_quote_qty: 0.0,
        age_minutes: 11.0,
    });

    let result = h
        .manager
        .sell(&Coin::new("BTC"), &Coin::new("USDT"), &NullTradeStore)
        .await
        .unwrap();

    assert!(result.is_none(), "timed-out order yields no trade");
    assert_eq!(h.api.canceled.lock().unwrap().len(), 1);
    assert!(h.pending.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resync_completes_waiting_buy() {
    let h = build_harness(Settings::default());
    h.api.set_balance("USDT", 100.0);
    h.api.set_ticker("BTCUSDT", 50000.0);
    // The stream only ever reports NEW; the fill is observable via REST
    *h.api.buy_fill.lock().unwrap() = Some(ScriptedFill {
        status: OrderStatus::New,
        cumulative_quote_qty: 0.0,
        age_minutes: 0.0,
    });
    *h.api.status_response.lock().unwrap() = Some((OrderStatus::Filled, 99.9));

    let manager = h.manager.clone();
    let buy_task = tokio::spawn(async move {
        manager
            .buy(&Coin::new("BTC"), &Coin::new("USDT"), &NullTradeStore)
            .await
    });

    // Wait for the order to be registered, then simulate a reconnect
    while h.pending.is_empty().await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.signal_tx
        .send(StreamSignal::Connect(StreamChannel::UserData))
        .await
        .unwrap();

    let order = buy_task
        .await
        .unwrap()
        .unwrap()
        .expect("resync should surface the fill");

    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.cumulative_quote_qty, 99.9);
    assert_eq!(h.api.status_fetches.load(Ordering::SeqCst), 1);
    assert!(h.pending.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_absorbed() {
    let h = build_harness(Settings::default());
    h.api.set_balance("USDT", 100.0);
    h.api.set_ticker("BTCUSDT", 50000.0);
    // Two balance fetches and one placement fail before anything works
    h.api.balance_failures.store(2, Ordering::SeqCst);
    h.api.buy_rejections.store(1, Ordering::SeqCst);
    *h.api.buy_fill.lock().unwrap() = Some(ScriptedFill {
        status: OrderStatus::Filled,
        cumulative_quote_qty: 99.95,
        age_minutes: 0.0,
    });

    let order = h
        .manager
        .buy(&Coin::new("BTC"), &Coin::new("USDT"), &NullTradeStore)
        .await
        .unwrap()
        .expect("buy should fill after transient failures");

    assert_eq!(order.status, OrderStatus::Filled);
    // Two failed attempts plus the one that fetched successfully
    assert_eq!(h.api.balance_calls.load(Ordering::SeqCst), 3);
    // One rejected placement, then the acknowledged one
    assert_eq!(h.api.buy_calls.load(Ordering::SeqCst), 2);
    assert!(h.pending.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_yields_no_trade() {
    let h = build_harness(Settings::default());
    h.api.set_balance("USDT", 100.0);
    h.api.set_ticker("BTCUSDT", 50000.0);
    // Every balance fetch fails; the attempt budget runs out
    h.api.balance_failures.store(usize::MAX, Ordering::SeqCst);

    let result = h
        .manager
        .buy(&Coin::new("BTC"), &Coin::new("USDT"), &NullTradeStore)
        .await
        .unwrap();

    assert!(result.is_none(), "exhaustion is no-trade, not an error");
    // One fetch per attempt
    assert_eq!(h.api.balance_calls.load(Ordering::SeqCst), 20);
    assert_eq!(h.api.buy_calls.load(Ordering::SeqCst), 0);
    assert!(h.pending.is_empty().await);
}
