use std::sync::Arc;

use crate::error::EngineError;
use crate::models::{Candle, Signal, StrategyId, TradeSide};

/// Base trait for all trading strategies.
///
/// Strategies are pure with respect to engine state: they look at the candle
/// window and emit zero or more signals. They never place orders.
pub trait Strategy: Send + Sync {
    /// Identifier the engine registers this strategy under.
    fn id(&self) -> StrategyId;

    /// Evaluate the rolling candle window (oldest first).
    fn evaluate(&self, window: &[Candle]) -> crate::Result<Vec<Signal>>;

    /// Minimum candles required before this strategy produces signals.
    fn min_candles(&self) -> usize {
        1
    }
}

/// Registration table mapping a `StrategyId` to its implementation, resolved
/// once at registration rather than by runtime name lookup.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    entries: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) -> Result<(), EngineError> {
        let id = strategy.id();
        if self.entries.iter().any(|s| s.id() == id) {
            return Err(EngineError::config(format!(
                "strategy '{id}' is already registered"
            )));
        }
        self.entries.push(strategy);
        Ok(())
    }

    pub fn strategies(&self) -> &[Arc<dyn Strategy>] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Simple moving-average crossover strategy.
///
/// Ships with the engine so the demo binary has something to run; real
/// deployments register their own implementations of [`Strategy`].
#[derive(Debug, Clone)]
pub struct SmaCrossover {
    short_period: usize,
    long_period: usize,
}

impl SmaCrossover {
    pub fn new(short_period: usize, long_period: usize) -> Self {
        Self {
            short_period,
            long_period,
        }
    }

    fn sma(closes: &[f64], period: usize) -> f64 {
        let tail = &closes[closes.len() - period..];
        tail.iter().sum::<f64>() / period as f64
    }
}

impl Default for SmaCrossover {
    fn default() -> Self {
        Self::new(10, 20)
    }
}

impl Strategy for SmaCrossover {
    fn id(&self) -> StrategyId {
        StrategyId::new(format!("sma-crossover-{}-{}", self.short_period, self.long_period))
    }

    fn evaluate(&self, window: &[Candle]) -> crate::Result<Vec<Signal>> {
        if window.len() < self.min_candles() {
            return Ok(Vec::new());
        }
        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
        let latest = window.last().expect("window checked non-empty");

        let short_now = Self::sma(&closes, self.short_period);
        let long_now = Self::sma(&closes, self.long_period);
        let prev = &closes[..closes.len() - 1];
        let short_prev = Self::sma(prev, self.short_period);
        let long_prev = Self::sma(prev, self.long_period);

        let side = if short_prev <= long_prev && short_now > long_now {
            Some(TradeSide::Buy)
        } else if short_prev >= long_prev && short_now < long_now {
            Some(TradeSide::Sell)
        } else {
            None
        };

        Ok(side
            .map(|side| Signal {
                timestamp: latest.open_time,
                side,
                reference_price: latest.close,
                strategy: self.id(),
                reason: format!("sma {:.4}/{:.4} crossover", short_now, long_now),
            })
            .into_iter()
            .collect())
    }

    fn min_candles(&self) -> usize {
        self.long_period + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now() - Duration::minutes(5 * closes.len() as i64);
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: start + Duration::minutes(5 * i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1_000.0,
            })
            .collect()
    }

    struct FixedSignal(Vec<Signal>);

    impl Strategy for FixedSignal {
        fn id(&self) -> StrategyId {
            StrategyId::new("fixed")
        }

        fn evaluate(&self, _window: &[Candle]) -> crate::Result<Vec<Signal>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(FixedSignal(Vec::new()))).unwrap();
        let err = registry.register(Arc::new(FixedSignal(Vec::new())));
        assert!(err.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_crossover_emits_buy_on_upward_cross() {
        let strategy = SmaCrossover::new(2, 4);
        // Flat history, then a jump that pushes the short MA above the long.
        let closes = vec![100.0, 100.0, 100.0, 100.0, 100.0, 110.0];
        let signals = strategy.evaluate(&candles_from_closes(&closes)).unwrap();

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, TradeSide::Buy);
    }

    #[test]
    fn test_crossover_emits_sell_on_downward_cross() {
        let strategy = SmaCrossover::new(2, 4);
        let closes = vec![100.0, 100.0, 100.0, 100.0, 100.0, 90.0];
        let signals = strategy.evaluate(&candles_from_closes(&closes)).unwrap();

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, TradeSide::Sell);
    }

    #[test]
    fn test_crossover_silent_without_cross() {
        let strategy = SmaCrossover::new(2, 4);
        let closes = vec![100.0, 100.0, 100.0, 100.0, 100.0, 100.0];
        let signals = strategy.evaluate(&candles_from_closes(&closes)).unwrap();
        assert!(signals.is_empty());
    }

    #[test]
    fn test_crossover_needs_enough_candles() {
        let strategy = SmaCrossover::new(2, 4);
        let closes = vec![100.0, 101.0];
        let signals = strategy.evaluate(&candles_from_closes(&closes)).unwrap();
        assert!(signals.is_empty());
    }
}
