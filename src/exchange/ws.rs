use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::exchange::error::ExchangeError;
use crate::exchange::rest::BinanceRest;
use crate::models::{
    AssetBalance, Order, OrderStatus, Side, StreamChannel, StreamEvent, StreamSignal, TickerTick,
};

/// Listen keys expire after 60 minutes; refresh at half that
const LISTEN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn reconnect_delay(attempts: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempts.min(16));
    Duration::from_secs(secs).min(MAX_RECONNECT_DELAY)
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

/// Public market mini-ticker channel. Forwards ticker batches into the
/// data sequence and connection lifecycle into the signal sequence.
pub struct MarketStream {
    url: String,
    signal_tx: mpsc::Sender<StreamSignal>,
    data_tx: mpsc::Sender<StreamEvent>,
    /// Reconnection attempts before giving up; 0 means unlimited
    max_reconnects: u32,
    shutdown: watch::Receiver<bool>,
}

impl MarketStream {
    pub fn new(
        tld: &str,
        signal_tx: mpsc::Sender<StreamSignal>,
        data_tx: mpsc::Sender<StreamEvent>,
        max_reconnects: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            url: format!("wss://stream.binance.{}:9443/ws/!miniTicker@arr", tld),
            signal_tx,
            data_tx,
            max_reconnects,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), ExchangeError> {
        let mut attempts: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    attempts = 0;
                    let _ = self
                        .signal_tx
                        .send(StreamSignal::Connect(StreamChannel::MiniTicker))
                        .await;
                    tracing::info!("Connected to mini-ticker stream");

                    let end = read_session(
                        ws,
                        &self.data_tx,
                        &mut self.shutdown,
                        parse_market_message,
                        None,
                    )
                    .await;

                    let _ = self
                        .signal_tx
                        .send(StreamSignal::Disconnect(StreamChannel::MiniTicker))
                        .await;

                    if matches!(end, SessionEnd::Shutdown) {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Mini-ticker stream connect failed");
                }
            }

            attempts += 1;
            if self.max_reconnects != 0 && attempts > self.max_reconnects {
                return Err(ExchangeError::ConnectionExhausted { attempts });
            }
            wait_before_reconnect(attempts, &mut self.shutdown).await;
        }
    }
}

/// Authenticated user-data channel: execution reports, balance updates,
/// account snapshots. Owns the listen-key lifecycle.
pub struct UserDataStream {
    rest: Arc<BinanceRest>,
    ws_base: String,
    signal_tx: mpsc::Sender<StreamSignal>,
    data_tx: mpsc::Sender<StreamEvent>,
    max_reconnects: u32,
    shutdown: watch::Receiver<bool>,
}

impl UserDataStream {
    pub fn new(
        rest: Arc<BinanceRest>,
        tld: &str,
        signal_tx: mpsc::Sender<StreamSignal>,
        data_tx: mpsc::Sender<StreamEvent>,
        max_reconnects: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rest,
            ws_base: format!("wss://stream.binance.{}:9443/ws", tld),
            signal_tx,
            data_tx,
            max_reconnects,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), ExchangeError> {
        let mut attempts: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            let session = self.run_session().await;
            match session {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Dropped) => {
                    attempts += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "User-data stream error");
                    attempts += 1;
                }
            }

            if self.max_reconnects != 0 && attempts > self.max_reconnects {
                return Err(ExchangeError::ConnectionExhausted { attempts });
            }
            wait_before_reconnect(attempts, &mut self.shutdown).await;
        }
    }

    async fn run_session(&mut self) -> Result<SessionEnd, ExchangeError> {
        let listen_key = self.rest.create_listen_key().await?;
        let url = format!("{}/{}", self.ws_base, listen_key);

        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ExchangeError::WebSocket(e.to_string()))?;

        let _ = self
            .signal_tx
            .send(StreamSignal::Connect(StreamChannel::UserData))
            .await;
        tracing::info!("Connected to user-data stream");

        let end = read_session(
            ws,
            &self.data_tx,
            &mut self.shutdown,
            parse_user_data_event,
            Some((&self.rest, listen_key.as_str())),
        )
        .await;

        let _ = self
            .signal_tx
            .send(StreamSignal::Disconnect(StreamChannel::UserData))
            .await;

        if matches!(end, SessionEnd::Shutdown) {
            if let Err(e) = self.rest.close_listen_key(&listen_key).await {
                tracing::warn!(error = %e, "Failed to close listen key during shutdown");
            }
        }

        Ok(end)
    }
}

/// Pump one WebSocket session: forward parsed events, answer pings,
/// refresh the listen key when one is attached.
async fn read_session(
    ws: WsStream,
    data_tx: &mpsc::Sender<StreamEvent>,
    shutdown: &mut watch::Receiver<bool>,
    parse: fn(&str) -> Option<StreamEvent>,
    listen_key: Option<(&Arc<BinanceRest>, &str)>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let mut keepalive = tokio::time::interval(LISTEN_KEY_REFRESH_INTERVAL);
    // Skip the immediate first tick
    keepalive.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.close().await;
                    return SessionEnd::Shutdown;
                }
            }

            _ = keepalive.tick() => {
                if let Some((rest, key)) = listen_key {
                    if let Err(e) = rest.keepalive_listen_key(key).await {
                        tracing::warn!(error = %e, "Listen key refresh failed, reconnecting");
                        return SessionEnd::Dropped;
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse(&text) {
                            Some(event) => {
                                if data_tx.send(event).await.is_err() {
                                    // Reconciler is gone; nothing left to feed
                                    return SessionEnd::Shutdown;
                                }
                            }
                            None => {
                                tracing::warn!(payload = %text, "Unparseable stream payload");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            tracing::warn!(error = %e, "Failed to answer ping");
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Stream closed by server");
                        return SessionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket read error");
                        return SessionEnd::Dropped;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn wait_before_reconnect(attempts: u32, shutdown: &mut watch::Receiver<bool>) {
    let delay = reconnect_delay(attempts);
    tracing::debug!(attempts, delay_secs = delay.as_secs(), "Reconnecting");
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}

/// Translate one user-data payload into a typed event. Returns `None`
/// only for malformed JSON; recognized-but-unknown event types map to
/// [`StreamEvent::Unknown`] so the reconciler can report them.
pub(crate) fn parse_user_data_event(text: &str) -> Option<StreamEvent> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let event_type = v.get("e")?.as_str()?;

    match event_type {
        "executionReport" => {
            let order = Order {
                id: v.get("i")?.as_u64()?,
                symbol: v.get("s")?.as_str()?.to_string(),
                side: Side::parse(v.get("S")?.as_str()?)?,
                order_type: v.get("o")?.as_str()?.to_string(),
                cumulative_quote_qty: v.get("Z")?.as_str()?.parse().ok()?,
                status: OrderStatus::parse(v.get("X")?.as_str()?)?,
                price: v.get("p")?.as_str()?.parse().ok()?,
                time: v.get("T")?.as_i64()?,
            };
            Some(StreamEvent::ExecutionReport(order))
        }
        "balanceUpdate" => Some(StreamEvent::BalanceUpdate {
            asset: v.get("a")?.as_str()?.to_string(),
        }),
        "outboundAccountPosition" | "outboundAccountInfo" => {
            let raw = v.get("B")?.as_array()?;
            let mut balances = Vec::with_capacity(raw.len());
            for entry in raw {
                balances.push(AssetBalance {
                    asset: entry.get("a")?.as_str()?.to_string(),
                    free: entry.get("f")?.as_str()?.parse().ok()?,
                });
            }
            Some(StreamEvent::AccountSnapshot { balances })
        }
        other => Some(StreamEvent::Unknown {
            event_type: other.to_string(),
        }),
    }
}

/// Translate one mini-ticker array payload into a ticker batch.
pub(crate) fn parse_market_message(text: &str) -> Option<StreamEvent> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let items = v.as_array()?;

    let mut ticks = Vec::with_capacity(items.len());
    for item in items {
        if item.get("e")?.as_str()? != "24hrMiniTicker" {
            continue;
        }
        ticks.push(TickerTick {
            symbol: item.get("s")?.as_str()?.to_string(),
            close_price: item.get("c")?.as_str()?.parse().ok()?,
        });
    }

    Some(StreamEvent::MiniTickers(ticks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_execution_report() {
        let payload = r#"{
            "e": "executionReport", "E": 1700000001000,
            "s": "ETHUSDT", "c": "abc123", "S": "BUY", "o": "LIMIT",
            "f": "GTC", "q": "1.00000000", "p": "2000.00000000",
            "x": "TRADE", "X": "FILLED", "i": 4293153,
            "l": "1.00000000", "z": "1.00000000", "L": "2000.00000000",
            "Z": "2000.00000000", "T": 1700000000900
        }"#;

        let event = parse_user_data_event(payload).unwrap();
        match event {
            StreamEvent::ExecutionReport(order) => {
                assert_eq!(order.id, 4293153);
                assert_eq!(order.symbol, "ETHUSDT");
                assert_eq!(order.side, Side::Buy);
                assert_eq!(order.order_type, "LIMIT");
                assert_eq!(order.status, OrderStatus::Filled);
                assert_eq!(order.price, 2000.0);
                assert_eq!(order.cumulative_quote_qty, 2000.0);
                assert_eq!(order.time, 1_700_000_000_900);
            }
            other => panic!("expected execution report, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_balance_update() {
        let payload = r#"{"e":"balanceUpdate","E":1700000000000,"a":"BTC","d":"-0.5","T":1700000000000}"#;
        assert_eq!(
            parse_user_data_event(payload),
            Some(StreamEvent::BalanceUpdate {
                asset: "BTC".to_string()
            })
        );
    }

    #[test]
    fn test_parse_account_position_snapshot() {
        let payload = r#"{
            "e": "outboundAccountPosition", "E": 1700000000000, "u": 1700000000000,
            "B": [
                {"a": "ETH", "f": "10.5", "l": "0.0"},
                {"a": "USDT", "f": "250.00", "l": "0.0"}
            ]
        }"#;

        let event = parse_user_data_event(payload).unwrap();
        match event {
            StreamEvent::AccountSnapshot { balances } => {
                assert_eq!(balances.len(), 2);
                assert_eq!(balances[0].asset, "ETH");
                assert_eq!(balances[0].free, 10.5);
                assert_eq!(balances[1].asset, "USDT");
                assert_eq!(balances[1].free, 250.0);
            }
            other => panic!("expected account snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_is_reported_not_dropped() {
        let payload = r#"{"e":"listStatus","E":1700000000000}"#;
        assert_eq!(
            parse_user_data_event(payload),
            Some(StreamEvent::Unknown {
                event_type: "listStatus".to_string()
            })
        );
    }

    #[test]
    fn test_malformed_payload_is_none() {
        assert_eq!(parse_user_data_event("not json"), None);
        assert_eq!(parse_user_data_event(r#"{"no_event_type":1}"#), None);
    }

    #[test]
    fn test_parse_mini_ticker_batch() {
        let payload = r#"[
            {"e":"24hrMiniTicker","E":1700000000000,"s":"ETHUSDT","c":"2001.50","o":"1990.0","h":"2010.0","l":"1980.0","v":"1000","q":"2000000"},
            {"e":"24hrMiniTicker","E":1700000000000,"s":"BTCUSDT","c":"50100.00","o":"49000.0","h":"50500.0","l":"48800.0","v":"100","q":"5000000"}
        ]"#;

        let event = parse_market_message(payload).unwrap();
        match event {
            StreamEvent::MiniTickers(ticks) => {
                assert_eq!(ticks.len(), 2);
                assert_eq!(ticks[0].symbol, "ETHUSDT");
                assert_eq!(ticks[0].close_price, 2001.5);
                assert_eq!(ticks[1].symbol, "BTCUSDT");
                assert_eq!(ticks[1].close_price, 50100.0);
            }
            other => panic!("expected ticker batch, got {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(10), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(u32::MAX), MAX_RECONNECT_DELAY);
    }
}
