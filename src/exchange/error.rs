use thiserror::Error;

/// Everything that can go wrong talking to the exchange.
///
/// Transient variants are absorbed by retry loops at the point of
/// occurrence; the rest abort the current flow.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Exchange-side rejection (bad symbol, rate limit, ...)
    #[error("exchange rejected request (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("malformed exchange response: {0}")]
    Parse(String),

    #[error("symbol {symbol} has no {filter_type} filter")]
    MissingFilter {
        symbol: String,
        filter_type: &'static str,
    },

    /// Order guard entered before an order id was attached. This is a
    /// programming error, never retried.
    #[error("order guard entered without an attached order id")]
    GuardNotSet,

    #[error("trade log error: {0}")]
    Storage(String),

    /// Reconnection attempts exceeded the configured bound. Fatal to the
    /// whole process.
    #[error("gave up reconnecting to the exchange after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },
}

impl ExchangeError {
    /// Whether a retry loop may absorb this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_)
                | ExchangeError::Api { .. }
                | ExchangeError::WebSocket(_)
                | ExchangeError::Storage(_)
        )
    }
}
