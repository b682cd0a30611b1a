// Exchange adapter seam. Concrete wire protocols live behind this trait; the
// engine only ever talks to it through the order execution gateway.
pub mod sim;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::models::{Candle, ExchangePosition, OrderFill, OrderRequest, Timeframe};

pub use sim::SimulatedExchange;

/// Narrow contract every exchange integration implements.
///
/// Reads (`get_candles`, `get_open_positions`, `find_order`) are freely
/// retryable. `place_market_order` mutates exchange state and is only ever
/// invoked by the gateway, which owns the idempotency policy around it.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Most recent `limit` closed candles for the symbol, oldest first.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Submit a market order. The request's correlation id must be attached
    /// to the resulting order so `find_order` can recognize it later.
    async fn place_market_order(&self, request: &OrderRequest)
        -> Result<OrderFill, ExchangeError>;

    /// Authoritative open positions for a symbol.
    async fn get_open_positions(
        &self,
        symbol: &str,
    ) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Look up a previously submitted order by its correlation id. Returns
    /// `None` when the exchange has no record of it, which tells the gateway
    /// an ambiguous failure never executed.
    async fn find_order(&self, correlation_id: Uuid) -> Result<Option<OrderFill>, ExchangeError>;
}
