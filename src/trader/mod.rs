use std::sync::Arc;

use crate::config::Settings;
use crate::exchange::error::ExchangeError;
use crate::exchange::manager::ExchangeManager;
use crate::models::{Coin, Order};
use crate::persistence::TradeStore;

const BTC_SYMBOL: &str = "BTC";

/// High-level trading session over one coin/fiat pair.
///
/// Owns the balance bookkeeping around the execution engine: records the
/// portfolio's collated value in several reference symbols at startup and
/// reports each one's change on every subsequent pass.
pub struct Trader {
    manager: Arc<ExchangeManager>,
    store: Box<dyn TradeStore>,
    settings: Settings,
}

impl Trader {
    pub fn new(manager: Arc<ExchangeManager>, store: Box<dyn TradeStore>, settings: Settings) -> Self {
        Self {
            manager,
            store,
            settings,
        }
    }

    /// Assets whose balances make up the portfolio value.
    fn tracked_assets(&self) -> Vec<String> {
        let mut assets = vec![self.settings.fiat_symbol.clone()];
        if !assets.contains(&self.settings.coin_symbol) {
            assets.push(self.settings.coin_symbol.clone());
        }
        assets
    }

    /// Symbols the portfolio value is expressed in: fiat, BTC and the
    /// traded coin.
    fn baseline_symbols(&self) -> Vec<String> {
        let mut symbols = vec![self.settings.fiat_symbol.clone()];
        for candidate in [BTC_SYMBOL, self.settings.coin_symbol.as_str()] {
            if !symbols.iter().any(|s| s == candidate) {
                symbols.push(candidate.to_string());
            }
        }
        symbols
    }

    /// Record the portfolio's collated value in every baseline symbol.
    pub async fn initialize_starting_balances(&self) -> Result<(), ExchangeError> {
        let assets = self.tracked_assets();
        let mut values = Vec::new();
        for symbol in self.baseline_symbols() {
            let collated = self.manager.collate_balances(&symbol, &assets).await?;
            values.push((symbol, collated));
        }

        let mut starting = self.manager.cache().starting_balances().await;
        for (symbol, collated) in &values {
            starting.insert(symbol.clone(), *collated);
        }
        drop(starting);

        for (symbol, collated) in values {
            tracing::info!("Starting balance: {:.8} {}", collated, symbol);
        }
        Ok(())
    }

    /// Refresh balances and log the portfolio value against each recorded
    /// baseline, in BTC, fiat and the display symbol.
    pub async fn display_balance(&self) -> Result<(), ExchangeError> {
        // Clear the cached balances once and only once
        {
            let mut balances = self.manager.cache().open_balances().await;
            balances.clear();
        }

        let shown = [
            BTC_SYMBOL.to_string(),
            self.settings.fiat_symbol.clone(),
            self.settings.repr_symbol.clone(),
        ];
        let baselines: Vec<(String, f64)> = {
            let starting = self.manager.cache().starting_balances().await;
            starting
                .iter()
                .filter(|(symbol, _)| shown.contains(symbol))
                .map(|(symbol, value)| (symbol.clone(), *value))
                .collect()
        };

        let assets = self.tracked_assets();
        for (symbol, baseline) in baselines {
            let collated = self.manager.collate_balances(&symbol, &assets).await?;
            tracing::info!(
                "Balance: {:.8} {} ({:+.2}%)",
                collated,
                symbol,
                change_percent(collated, baseline)
            );
        }
        Ok(())
    }

    /// Buy the tracked coin with the full fiat balance.
    pub async fn buy_coin(&self) -> Result<Option<Order>, ExchangeError> {
        let coin = Coin::new(&self.settings.coin_symbol);
        let fiat = Coin::new(&self.settings.fiat_symbol);
        self.manager.buy(&coin, &fiat, self.store.as_ref()).await
    }

    /// Sell the full tracked-coin balance into fiat.
    pub async fn sell_coin(&self) -> Result<Option<Order>, ExchangeError> {
        let coin = Coin::new(&self.settings.coin_symbol);
        let fiat = Coin::new(&self.settings.fiat_symbol);
        self.manager.sell(&coin, &fiat, self.store.as_ref()).await
    }
}

/// Change relative to the current value, not the baseline.
fn change_percent(current: f64, baseline: f64) -> f64 {
    if current == 0.0 {
        return 0.0;
    }
    (current - baseline) / current * 100.0
}
