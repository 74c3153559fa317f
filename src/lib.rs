// Core modules
pub mod config;
pub mod exchange;
pub mod models;
pub mod persistence;
pub mod trader;

// Re-export commonly used types
pub use exchange::{ExchangeCache, ExchangeManager, StreamReconciler};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
