use altrader::config::Settings;
use altrader::exchange::{
    BinanceRest, ExchangeApi, ExchangeCache, ExchangeError, ExchangeManager, MarketStream,
    PendingOrders, StreamReconciler, UserDataStream,
};
use altrader::persistence::{NullTradeStore, PostgresTradeStore, TradeStore};
use altrader::trader::Trader;
use altrader::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::Duration;

const SIGNAL_CHANNEL_CAPACITY: usize = 64;
const DATA_CHANNEL_CAPACITY: usize = 1024;
const BALANCE_DISPLAY_INTERVAL: Duration = Duration::from_secs(60);

type StreamResult = std::result::Result<std::result::Result<(), ExchangeError>, JoinError>;

enum Finished {
    Signal,
    Market(StreamResult),
    UserData(StreamResult),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let settings = Settings::load()?;
    tracing::info!(
        "Starting altrader ({}/{})",
        settings.coin_symbol,
        settings.fiat_symbol
    );

    let rest = Arc::new(BinanceRest::new(&settings)?);
    let api: Arc<dyn ExchangeApi> = rest.clone();
    let cache = Arc::new(ExchangeCache::new());
    let pending = PendingOrders::new();

    let manager = Arc::new(ExchangeManager::new(
        api.clone(),
        cache.clone(),
        pending.clone(),
        settings.clone(),
    ));
    manager.test_connection().await?;
    tracing::info!("Exchange connection verified");

    let store = connect_to_postgres().await;

    // One event pipeline shared by both streams; the reconciler stops once
    // every sender is dropped
    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = StreamReconciler::new(
        cache.clone(),
        api.clone(),
        pending.clone(),
        signal_rx,
        data_rx,
    );
    let reconciler_task = tokio::spawn(reconciler.run());

    let market = MarketStream::new(
        &settings.tld,
        signal_tx.clone(),
        data_tx.clone(),
        settings.reconnect_retries,
        shutdown_rx.clone(),
    );
    let mut market_task = tokio::spawn(market.run());

    let user_data = UserDataStream::new(
        rest.clone(),
        &settings.tld,
        signal_tx,
        data_tx,
        settings.reconnect_retries,
        shutdown_rx,
    );
    let mut user_data_task = tokio::spawn(user_data.run());

    let trader = Trader::new(manager, store, settings);
    trader.initialize_starting_balances().await?;

    let mut display_timer = tokio::time::interval(BALANCE_DISPLAY_INTERVAL);
    display_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    display_timer.tick().await;

    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break Finished::Signal;
            }
            _ = display_timer.tick() => {
                if let Err(e) = trader.display_balance().await {
                    tracing::warn!("Balance display failed: {}", e);
                }
            }
            result = &mut market_task => break Finished::Market(result),
            result = &mut user_data_task => break Finished::UserData(result),
        }
    };

    // Stop the remaining streams; the reconciler drains and exits once
    // their senders are gone
    let _ = shutdown_tx.send(true);
    let exit = match finished {
        Finished::Signal => {
            let _ = market_task.await;
            let _ = user_data_task.await;
            Ok(())
        }
        Finished::Market(result) => {
            let _ = user_data_task.await;
            stream_exit("market stream", result)
        }
        Finished::UserData(result) => {
            let _ = market_task.await;
            stream_exit("user data stream", result)
        }
    };
    let _ = reconciler_task.await;

    tracing::info!("Shutdown complete");
    exit
}

fn stream_exit(name: &str, result: StreamResult) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            tracing::info!("{} stopped", name);
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("{} failed: {}", name, e);
            Err(e.into())
        }
        Err(e) => {
            tracing::error!("{} task panicked: {}", name, e);
            Err(e.into())
        }
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "altrader=info".into()),
        )
        .init();
}

async fn connect_to_postgres() -> Box<dyn TradeStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::info!("DATABASE_URL not set, trade history disabled");
        return Box::new(NullTradeStore);
    };

    match PostgresTradeStore::new(&database_url).await {
        Ok(store) => {
            tracing::info!("Trade history enabled at {}", database_url);
            Box::new(store)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without trade history",
                e
            );
            Box::new(NullTradeStore)
        }
    }
}
