pub mod api;
pub mod cache;
pub mod error;
pub mod guard;
pub mod manager;
pub mod rest;
pub mod stream;
pub mod ws;

pub use api::{ExchangeApi, OrderAck};
pub use cache::ExchangeCache;
pub use error::ExchangeError;
pub use guard::{ActiveOrder, OrderGuard, PendingOrders};
pub use manager::ExchangeManager;
pub use rest::BinanceRest;
pub use stream::StreamReconciler;
pub use ws::{MarketStream, UserDataStream};
