use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::Receiver;

use crate::exchange::api::ExchangeApi;
use crate::exchange::cache::ExchangeCache;
use crate::exchange::guard::PendingOrders;
use crate::models::{StreamChannel, StreamEvent, StreamSignal};

/// How long to yield when both sequences are empty
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Delay between resync attempts for one pending order
const RESYNC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Applies push-stream events to the [`ExchangeCache`], single-threaded,
/// in arrival order, with no batching.
///
/// The push stream has no delivery guarantee across a disconnect window:
/// any execution report during the gap is lost. On reconnection of the
/// authenticated channel every order in the pending set is therefore
/// re-fetched over REST and the balance cache is invalidated.
pub struct StreamReconciler {
    cache: Arc<ExchangeCache>,
    api: Arc<dyn ExchangeApi>,
    pending: PendingOrders,
    signal_rx: Receiver<StreamSignal>,
    data_rx: Receiver<StreamEvent>,
}

impl StreamReconciler {
    pub fn new(
        cache: Arc<ExchangeCache>,
        api: Arc<dyn ExchangeApi>,
        pending: PendingOrders,
        signal_rx: Receiver<StreamSignal>,
        data_rx: Receiver<StreamEvent>,
    ) -> Self {
        Self {
            cache,
            api,
            pending,
            signal_rx,
            data_rx,
        }
    }

    /// Drain both sequences until every sender is gone.
    pub async fn run(mut self) {
        loop {
            let signal = self.signal_rx.try_recv();
            let data = self.data_rx.try_recv();

            if matches!(signal, Err(TryRecvError::Disconnected))
                && matches!(data, Err(TryRecvError::Disconnected))
            {
                tracing::debug!("Stream channels closed, reconciler stopping");
                return;
            }

            let mut idle = true;

            if let Ok(signal) = signal {
                idle = false;
                self.handle_signal(signal).await;
            }

            if let Ok(event) = data {
                idle = false;
                self.apply_event(event).await;
            }

            if idle {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
    }

    async fn handle_signal(&self, signal: StreamSignal) {
        match signal {
            StreamSignal::Connect(StreamChannel::UserData) => {
                tracing::debug!("Received CONNECT signal for user-data channel");
                self.resync_pending_orders().await;
                self.invalidate_balances().await;
            }
            StreamSignal::Connect(StreamChannel::MiniTicker) => {
                tracing::debug!("Received CONNECT signal for mini-ticker channel");
            }
            StreamSignal::Disconnect(channel) => {
                tracing::debug!(?channel, "Received DISCONNECT signal");
            }
        }
    }

    /// Re-fetch every order the system is currently waiting on. One
    /// request per id, retried indefinitely on failure.
    async fn resync_pending_orders(&self) {
        for (symbol, order_id) in self.pending.snapshot().await {
            loop {
                match self.api.order_status(&symbol, order_id).await {
                    Ok(order) => {
                        tracing::debug!(
                            order_id,
                            symbol = %symbol,
                            status = ?order.status,
                            "Resynced pending order"
                        );
                        self.cache.record_order(order);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            order_id,
                            symbol = %symbol,
                            error = %e,
                            "Failed to resync pending order, retrying"
                        );
                        tokio::time::sleep(RESYNC_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    async fn invalidate_balances(&self) {
        let mut balances = self.cache.open_balances().await;
        balances.clear();
    }

    async fn apply_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::ExecutionReport(order) => {
                tracing::debug!(
                    order_id = order.id,
                    symbol = %order.symbol,
                    status = ?order.status,
                    "Execution report"
                );
                self.cache.record_order(order);
            }
            StreamEvent::BalanceUpdate { asset } => {
                tracing::debug!(asset = %asset, "Balance update");
                let mut balances = self.cache.open_balances().await;
                balances.remove(&asset);
            }
            StreamEvent::AccountSnapshot { balances: snapshot } => {
                tracing::debug!(assets = snapshot.len(), "Account position snapshot");
                let mut balances = self.cache.open_balances().await;
                balances.clear();
                for entry in snapshot {
                    balances.insert(entry.asset, entry.free);
                }
            }
            StreamEvent::MiniTickers(ticks) => {
                for tick in ticks {
                    self.cache.set_ticker(&tick.symbol, tick.close_price);
                }
            }
            StreamEvent::Unknown { event_type } => {
                tracing::error!(event_type = %event_type, "Unknown stream event type");
            }
        }
    }
}
