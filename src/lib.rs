// Core modules
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod exchange;
pub mod gateway;
pub mod models;
pub mod monitor;
pub mod position;
pub mod risk;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use error::{EngineError, ExchangeError};
pub use models::*;
pub use strategy::Strategy;

/// Crate-wide result type carrying the classified engine error.
pub type Result<T> = std::result::Result<T, EngineError>;
