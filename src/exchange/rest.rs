use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::Settings;
use crate::exchange::api::{ExchangeApi, OrderAck};
use crate::exchange::error::ExchangeError;
use crate::models::{AssetBalance, Order, OrderStatus, Side};

// Binance hard limit is 1200 request weight per minute; stay under it
const RATE_LIMIT_RPM: u32 = 1100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW_MS: u64 = 5000;

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type RequestLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Signed Binance REST client
pub struct BinanceRest {
    http: Client,
    base: String,
    api_key: String,
    api_secret: String,
    limiter: RequestLimiter,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    step_size: Option<String>,
    min_notional: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeFeeEntry {
    symbol: String,
    taker_commission: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BnbBurnResponse {
    #[serde(rename = "spotBNBBurn")]
    spot_bnb_burn: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderResponse {
    symbol: String,
    order_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQueryResponse {
    symbol: String,
    order_id: u64,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(rename = "cummulativeQuoteQty")]
    cumulative_quote_qty: String,
    status: String,
    price: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

fn parse_f64(value: &str, what: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("bad {} value: {:?}", what, value)))
}

impl BinanceRest {
    pub fn new(settings: &Settings) -> Result<Self, ExchangeError> {
        Self::with_base_url(
            format!("https://api.binance.{}", settings.tld),
            settings.api_key.clone(),
            settings.api_secret.clone(),
        )
    }

    pub fn with_base_url(
        base: String,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());

        Ok(Self {
            http,
            base,
            api_key,
            api_secret,
            limiter: RateLimiter::direct(quota),
        })
    }

    fn sign(&self, query: &str) -> String {
        // HMAC-SHA256 accepts keys of any length
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).unwrap();
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "timestamp={}&recvWindow={}",
            chrono::Utc::now().timestamp_millis(),
            RECV_WINDOW_MS
        ));

        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<String>,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.until_ready().await;

        let url = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base, path, q),
            _ => format!("{}{}", self.base, path),
        };

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => ExchangeError::Api {
                    code: err.code,
                    message: err.msg,
                },
                Err(_) => ExchangeError::Api {
                    code: status.as_u16() as i64,
                    message: body,
                },
            });
        }

        Ok(response.json().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<String>,
    ) -> Result<T, ExchangeError> {
        let value = self.send(method, path, query).await?;
        serde_json::from_value(value)
            .map_err(|e| ExchangeError::Parse(format!("{}: {}", path, e)))
    }

    async fn symbol_filter(
        &self,
        symbol: &str,
        filter_type: &'static str,
    ) -> Result<SymbolFilter, ExchangeError> {
        let info: ExchangeInfoResponse = self
            .get_json(
                Method::GET,
                "/api/v3/exchangeInfo",
                Some(format!("symbol={}", symbol)),
            )
            .await?;

        info.symbols
            .into_iter()
            .next()
            .and_then(|s| {
                s.filters
                    .into_iter()
                    .find(|f| f.filter_type == filter_type)
            })
            .ok_or(ExchangeError::MissingFilter {
                symbol: symbol.to_string(),
                filter_type,
            })
    }

    fn place_order_params(
        symbol: &str,
        side: Side,
        quantity: f64,
        price: Option<f64>,
    ) -> Vec<(&'static str, String)> {
        let mut params: Vec<(&'static str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
        ];

        match price {
            Some(price) => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("quantity", format!("{}", quantity)));
                params.push(("price", format!("{:.8}", price)));
            }
            None => {
                params.push(("type", "MARKET".to_string()));
                params.push(("quantity", format!("{}", quantity)));
            }
        }

        params
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<OrderAck, ExchangeError> {
        let params = Self::place_order_params(symbol, side, quantity, price);
        let query = self.signed_query(&params);

        tracing::info!(
            symbol = %symbol,
            side = side.as_str(),
            quantity,
            price = ?price,
            "Placing order"
        );

        let response: NewOrderResponse = self
            .get_json(Method::POST, "/api/v3/order", Some(query))
            .await?;

        tracing::info!(order_id = response.order_id, "Order accepted");

        Ok(OrderAck {
            order_id: response.order_id,
            symbol: response.symbol,
        })
    }

    // ========================================================================
    // Listen key lifecycle (user-data stream)
    // ========================================================================

    pub async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let response: ListenKeyResponse = self
            .get_json(Method::POST, "/api/v3/userDataStream", None)
            .await?;
        tracing::debug!("Created user-data listen key");
        Ok(response.listen_key)
    }

    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        self.send(
            Method::PUT,
            "/api/v3/userDataStream",
            Some(format!("listenKey={}", listen_key)),
        )
        .await?;
        tracing::debug!("Listen key refreshed");
        Ok(())
    }

    pub async fn close_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        self.send(
            Method::DELETE,
            "/api/v3/userDataStream",
            Some(format!("listenKey={}", listen_key)),
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExchangeApi for BinanceRest {
    async fn ping(&self) -> Result<(), ExchangeError> {
        self.send(Method::GET, "/api/v3/ping", None).await?;
        Ok(())
    }

    async fn account_balances(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let query = self.signed_query(&[]);
        let account: AccountResponse = self
            .get_json(Method::GET, "/api/v3/account", Some(query))
            .await?;

        account
            .balances
            .into_iter()
            .map(|b| {
                let free = parse_f64(&b.free, "balance")?;
                Ok(AssetBalance {
                    asset: b.asset,
                    free,
                })
            })
            .collect()
    }

    async fn all_ticker_prices(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let tickers: Vec<TickerEntry> = self
            .get_json(Method::GET, "/api/v3/ticker/price", None)
            .await?;

        tickers
            .into_iter()
            .map(|t| {
                let price = parse_f64(&t.price, "ticker price")?;
                Ok((t.symbol, price))
            })
            .collect()
    }

    async fn lot_size_step(&self, symbol: &str) -> Result<String, ExchangeError> {
        let filter = self.symbol_filter(symbol, "LOT_SIZE").await?;
        filter.step_size.ok_or(ExchangeError::MissingFilter {
            symbol: symbol.to_string(),
            filter_type: "LOT_SIZE",
        })
    }

    async fn min_notional(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let filter = self.symbol_filter(symbol, "MIN_NOTIONAL").await?;
        let raw = filter.min_notional.ok_or(ExchangeError::MissingFilter {
            symbol: symbol.to_string(),
            filter_type: "MIN_NOTIONAL",
        })?;
        parse_f64(&raw, "min notional")
    }

    async fn trade_fees(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let query = self.signed_query(&[]);
        let fees: Vec<TradeFeeEntry> = self
            .get_json(Method::GET, "/sapi/v1/asset/tradeFee", Some(query))
            .await?;

        fees.into_iter()
            .map(|f| {
                let fee = parse_f64(&f.taker_commission, "taker commission")?;
                Ok((f.symbol, fee))
            })
            .collect()
    }

    async fn using_fee_discount(&self) -> Result<bool, ExchangeError> {
        let query = self.signed_query(&[]);
        let burn: BnbBurnResponse = self
            .get_json(Method::GET, "/sapi/v1/bnbBurn", Some(query))
            .await?;
        Ok(burn.spot_bnb_burn)
    }

    async fn order_limit_buy(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.place_order(symbol, Side::Buy, quantity, Some(price))
            .await
    }

    async fn order_limit_sell(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.place_order(symbol, Side::Sell, quantity, Some(price))
            .await
    }

    async fn order_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.place_order(symbol, Side::Sell, quantity, None).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let query = self.signed_query(&params);
        self.send(Method::DELETE, "/api/v3/order", Some(query))
            .await?;
        tracing::info!(order_id, symbol = %symbol, "Order canceled");
        Ok(())
    }

    async fn order_status(&self, symbol: &str, order_id: u64) -> Result<Order, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let query = self.signed_query(&params);
        let response: OrderQueryResponse = self
            .get_json(Method::GET, "/api/v3/order", Some(query))
            .await?;

        let side = Side::parse(&response.side)
            .ok_or_else(|| ExchangeError::Parse(format!("bad order side: {}", response.side)))?;
        let status = OrderStatus::parse(&response.status).ok_or_else(|| {
            ExchangeError::Parse(format!("bad order status: {}", response.status))
        })?;

        Ok(Order {
            id: response.order_id,
            symbol: response.symbol,
            side,
            order_type: response.order_type,
            cumulative_quote_qty: parse_f64(
                &response.cumulative_quote_qty,
                "cumulative quote qty",
            )?,
            status,
            price: parse_f64(&response.price, "order price")?,
            time: response.time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> BinanceRest {
        BinanceRest::with_base_url(
            server.url(),
            "test-key".to_string(),
            "test-secret".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_ticker_prices_parses_bulk_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price")
            .with_status(200)
            .with_body(r#"[{"symbol":"ETHUSDT","price":"2000.50"},{"symbol":"BTCUSDT","price":"50000.00"}]"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let prices = client.all_ticker_prices().await.unwrap();

        assert_eq!(prices.len(), 2);
        assert_eq!(prices["ETHUSDT"], 2000.50);
        assert_eq!(prices["BTCUSDT"], 50000.00);
    }

    #[tokio::test]
    async fn test_api_error_body_is_mapped() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price")
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.all_ticker_prices().await.unwrap_err();

        match err {
            ExchangeError::Api { code, message } => {
                assert_eq!(code, -1121);
                assert_eq!(message, "Invalid symbol.");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_status_translates_to_order_record() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/order")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"symbol":"ETHUSDT","orderId":12345,"side":"BUY","type":"LIMIT",
                    "cummulativeQuoteQty":"123.45","status":"PARTIALLY_FILLED",
                    "price":"2000.00","time":1700000000000}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let order = client.order_status("ETHUSDT", 12345).await.unwrap();

        assert_eq!(order.id, 12345);
        assert_eq!(order.symbol, "ETHUSDT");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.cumulative_quote_qty, 123.45);
        assert_eq!(order.price, 2000.0);
        assert_eq!(order.time, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_lot_size_step_extraction() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/exchangeInfo")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"symbols":[{"filters":[
                    {"filterType":"PRICE_FILTER","tickSize":"0.01000000"},
                    {"filterType":"LOT_SIZE","stepSize":"0.00100000"}
                ]}]}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let step = client.lot_size_step("ETHUSDT").await.unwrap();
        assert_eq!(step, "0.00100000");
    }

    #[test]
    fn test_signed_query_carries_signature_and_timestamp() {
        let client = BinanceRest::with_base_url(
            "http://localhost".to_string(),
            "key".to_string(),
            "secret".to_string(),
        )
        .unwrap();

        let query = client.signed_query(&[("symbol", "ETHUSDT".to_string())]);
        assert!(query.starts_with("symbol=ETHUSDT&timestamp="));
        assert!(query.contains("&recvWindow=5000"));
        assert!(query.contains("&signature="));

        // Signature is hex-encoded HMAC-SHA256 (64 chars)
        let signature = query.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }
}
