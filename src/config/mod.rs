use anyhow::Context;
use serde::Deserialize;

/// Runtime settings, loaded from `trader.toml` (optional) with environment
/// overrides prefixed `TRADER_` (e.g. `TRADER_SELL_TIMEOUT=15`).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Binance top-level domain ("com", "us", ...)
    #[serde(default = "default_tld")]
    pub tld: String,
    /// Reconnection attempts before giving up; 0 means unlimited
    #[serde(default)]
    pub reconnect_retries: u32,
    /// Quote asset used as the trading bridge
    #[serde(default = "default_fiat")]
    pub fiat_symbol: String,
    /// Primary traded asset
    #[serde(default = "default_coin")]
    pub coin_symbol: String,
    /// Extra asset used for balance reporting
    #[serde(default = "default_fiat")]
    pub repr_symbol: String,
    /// Scheduler tick in seconds
    #[serde(default = "default_sleep")]
    pub sleep_time: u64,
    /// Minutes before an open SELL order is canceled; 0 disables the timeout
    #[serde(default)]
    pub sell_timeout: f64,
    /// Minutes before an open BUY order is canceled; 0 disables the timeout
    #[serde(default)]
    pub buy_timeout: f64,
}

fn default_tld() -> String {
    "com".to_string()
}

fn default_fiat() -> String {
    "USDT".to_string()
}

fn default_coin() -> String {
    "BTC".to_string()
}

fn default_sleep() -> u64 {
    1
}

impl Settings {
    /// Load settings from the optional config file and the environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("trader.toml")
    }

    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("TRADER"))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path))?
            .try_deserialize::<Settings>()
            .context("invalid configuration values")?;

        Ok(settings)
    }

    pub fn unlimited_reconnects(&self) -> bool {
        self.reconnect_retries == 0
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            tld: default_tld(),
            reconnect_retries: 0,
            fiat_symbol: default_fiat(),
            coin_symbol: default_coin(),
            repr_symbol: default_fiat(),
            sleep_time: default_sleep(),
            sell_timeout: 0.0,
            buy_timeout: 0.0,
        }
    }
}
