use crate::models::Coin;
use crate::Result;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

/// Lifecycle record of a single trade, advanced by the execution flow as
/// the trade moves from planned to ordered to complete.
#[async_trait]
pub trait TradeLog: Send + Sync {
    /// The order was accepted by the exchange.
    async fn set_ordered(
        &self,
        origin_starting_balance: f64,
        target_starting_balance: f64,
        origin_trade_amount: f64,
    ) -> Result<()>;

    /// The order reached a terminal fill.
    async fn set_complete(&self, target_trade_amount: f64) -> Result<()>;
}

/// Factory for trade logs. The execution flow opens one log per attempt.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn start_trade_log(
        &self,
        origin: &Coin,
        target: &Coin,
        selling: bool,
    ) -> Result<Box<dyn TradeLog>>;
}

/// Postgres-backed trade history
pub struct PostgresTradeStore {
    pool: PgPool,
}

impl PostgresTradeStore {
    /// Connect to Postgres and create the trades table if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id UUID PRIMARY KEY,
                origin_coin TEXT NOT NULL,
                target_coin TEXT NOT NULL,
                selling BOOLEAN NOT NULL,
                state TEXT NOT NULL,
                origin_starting_balance DOUBLE PRECISION,
                target_starting_balance DOUBLE PRECISION,
                origin_trade_amount DOUBLE PRECISION,
                target_trade_amount DOUBLE PRECISION,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&pool)
        .await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }
}

#[async_trait]
impl TradeStore for PostgresTradeStore {
    async fn start_trade_log(
        &self,
        origin: &Coin,
        target: &Coin,
        selling: bool,
    ) -> Result<Box<dyn TradeLog>> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO trades (id, origin_coin, target_coin, selling, state)
            VALUES ($1, $2, $3, $4, 'STARTING')
            "#,
        )
        .bind(id)
        .bind(&origin.symbol)
        .bind(&target.symbol)
        .bind(selling)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Started trade log {} for {}/{}", id, origin, target);

        Ok(Box::new(PostgresTradeLog {
            pool: self.pool.clone(),
            id,
        }))
    }
}

struct PostgresTradeLog {
    pool: PgPool,
    id: Uuid,
}

#[async_trait]
impl TradeLog for PostgresTradeLog {
    async fn set_ordered(
        &self,
        origin_starting_balance: f64,
        target_starting_balance: f64,
        origin_trade_amount: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                state = 'ORDERED',
                origin_starting_balance = $2,
                target_starting_balance = $3,
                origin_trade_amount = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(origin_starting_balance)
        .bind(target_starting_balance)
        .bind(origin_trade_amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_complete(&self, target_trade_amount: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                state = 'COMPLETE',
                target_trade_amount = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(target_trade_amount)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Trade log {} complete", self.id);

        Ok(())
    }
}

/// No-op store used when no database is configured.
pub struct NullTradeStore;

#[async_trait]
impl TradeStore for NullTradeStore {
    async fn start_trade_log(
        &self,
        _origin: &Coin,
        _target: &Coin,
        _selling: bool,
    ) -> Result<Box<dyn TradeLog>> {
        Ok(Box::new(NullTradeLog))
    }
}

struct NullTradeLog;

#[async_trait]
impl TradeLog for NullTradeLog {
    async fn set_ordered(&self, _: f64, _: f64, _: f64) -> Result<()> {
        Ok(())
    }

    async fn set_complete(&self, _: f64) -> Result<()> {
        Ok(())
    }
}
