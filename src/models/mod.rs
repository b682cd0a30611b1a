use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Candle timeframe. The poll interval of a monitor is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Length of one candle interval.
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(60),
            Timeframe::M5 => Duration::from_secs(5 * 60),
            Timeframe::M15 => Duration::from_secs(15 * 60),
            Timeframe::H1 => Duration::from_secs(60 * 60),
            Timeframe::H4 => Duration::from_secs(4 * 60 * 60),
            Timeframe::D1 => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// How often a monitor polls for a newly closed candle. A fraction of the
    /// interval so a fresh close is picked up promptly, floored at 10s.
    pub fn poll_interval(&self) -> Duration {
        let secs = (self.duration().as_secs() / 6).max(10);
        Duration::from_secs(secs)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(EngineError::config(format!("unknown timeframe '{other}'"))),
        }
    }
}

/// Identity of one monitoring task. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorKey {
    pub account_id: String,
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl MonitorKey {
    pub fn new(
        account_id: impl Into<String>,
        exchange_id: impl Into<String>,
        symbol: impl Into<String>,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            exchange_id: exchange_id.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }

    /// Validate the fields a key must carry before a monitor may start.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.account_id.trim().is_empty() {
            return Err(EngineError::config("monitor key has empty account id"));
        }
        if self.exchange_id.trim().is_empty() {
            return Err(EngineError::config("monitor key has empty exchange id"));
        }
        if self.symbol.trim().is_empty() {
            return Err(EngineError::config("monitor key has empty symbol"));
        }
        Ok(())
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.account_id, self.exchange_id, self.symbol, self.timeframe
        )
    }
}

/// OHLCV candlestick data for one interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Identifier of a registered strategy. Resolved once at registration, never
/// looked up by string at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyId(String);

impl StrategyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Direction of a trade or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn opposite(&self) -> TradeSide {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => f.write_str("buy"),
            TradeSide::Sell => f.write_str("sell"),
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens a position in this direction.
    pub fn entry_side(&self) -> TradeSide {
        match self {
            PositionSide::Long => TradeSide::Buy,
            PositionSide::Short => TradeSide::Sell,
        }
    }

    /// Order side that reduces or closes a position in this direction.
    pub fn close_side(&self) -> TradeSide {
        self.entry_side().opposite()
    }

    pub fn from_trade_side(side: TradeSide) -> PositionSide {
        match side {
            TradeSide::Buy => PositionSide::Long,
            TradeSide::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => f.write_str("long"),
            PositionSide::Short => f.write_str("short"),
        }
    }
}

/// Trading signal produced by a strategy. Immutable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub side: TradeSide,
    pub reference_price: f64,
    pub strategy: StrategyId,
    pub reason: String,
}

/// What an order is for, carried through to fills and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent {
    /// Open a new position.
    Entry,
    /// Flat-close opposing exposure before flipping direction.
    CloseOpposite,
    /// Protective stop hit, full close.
    StopLoss,
    /// First profit target, partial close.
    TakeProfit1,
    /// Trailing stop retracement, full close of the remainder.
    TrailingStop,
    /// Second profit ceiling, full close of the remainder.
    TakeProfit2,
}

/// A market order request heading to the execution gateway.
///
/// `correlation_id` is caller-generated and lets the gateway re-query the
/// exchange after an ambiguous failure without risking double execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub correlation_id: Uuid,
    pub key: MonitorKey,
    pub side: TradeSide,
    pub quantity: f64,
    pub intent: OrderIntent,
}

impl OrderRequest {
    pub fn new(key: MonitorKey, side: TradeSide, quantity: f64, intent: OrderIntent) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            key,
            side,
            quantity,
            intent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
}

/// Fill report returned by the exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_price: f64,
    pub filled_qty: f64,
    pub status: OrderStatus,
}

/// Exchange-side view of an open position, used when reconciling after an
/// ambiguous order failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_entry_price: f64,
}
