//! Signal dispatch: strategy evaluation, staleness filtering, and risk
//! admission for one evaluation cycle.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::models::{Candle, MonitorKey, PositionSide, Signal};
use crate::risk::{ProposedTrade, RiskGate};
use crate::strategy::StrategyRegistry;

/// Signal that cleared staleness and risk checks, sized and ready for the
/// gateway.
#[derive(Debug, Clone)]
pub struct AcceptedSignal {
    pub signal: Signal,
    pub sized_quantity: f64,
}

pub struct SignalDispatcher {
    registry: StrategyRegistry,
    risk: Arc<dyn RiskGate>,
    staleness_window: Duration,
    events: Arc<dyn EventSink>,
}

impl SignalDispatcher {
    pub fn new(
        registry: StrategyRegistry,
        risk: Arc<dyn RiskGate>,
        staleness_window: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            risk,
            staleness_window,
            events,
        }
    }

    /// A signal acts on the latest closed candle, or on one within the
    /// staleness window behind it. Anything newer than the latest candle or
    /// older than the window is rejected.
    fn eligibility(&self, signal: &Signal, latest: &Candle) -> Result<(), EngineError> {
        if signal.timestamp > latest.open_time {
            return Err(EngineError::StaleSignal {
                strategy: signal.strategy.to_string(),
                reason: format!(
                    "timestamp {} is ahead of the latest closed candle {}",
                    signal.timestamp, latest.open_time
                ),
            });
        }
        let age = latest.open_time - signal.timestamp;
        if age > self.staleness_window {
            return Err(EngineError::StaleSignal {
                strategy: signal.strategy.to_string(),
                reason: format!(
                    "{age} behind candle {}, window is {}",
                    latest.open_time, self.staleness_window
                ),
            });
        }
        Ok(())
    }

    /// Run every registered strategy against the window and return the
    /// signals that survive staleness and risk checks.
    ///
    /// Each strategy contributes at most one signal per cycle (its most
    /// recent eligible one), which bounds dispatch at one order per strategy
    /// per closed candle. A signal matching `current_side` skips the risk
    /// gate since it cannot produce a new order.
    pub fn dispatch(
        &self,
        key: &MonitorKey,
        window: &[Candle],
        current_side: Option<PositionSide>,
    ) -> Vec<AcceptedSignal> {
        let Some(latest) = window.last() else {
            return Vec::new();
        };
        let mut accepted = Vec::new();

        for strategy in self.registry.strategies() {
            if window.len() < strategy.min_candles() {
                debug!(
                    key = %key,
                    strategy = %strategy.id(),
                    have = window.len(),
                    need = strategy.min_candles(),
                    "window below strategy minimum, skipping"
                );
                continue;
            }

            let signals = match strategy.evaluate(window) {
                Ok(signals) => signals,
                Err(err) => {
                    warn!(key = %key, strategy = %strategy.id(), error = %err, "strategy evaluation failed");
                    continue;
                }
            };

            let mut newest: Option<Signal> = None;
            for signal in signals {
                if let Err(err) = self.eligibility(&signal, latest) {
                    debug!(key = %key, error = %err, "signal dropped");
                    continue;
                }
                let keep = newest
                    .as_ref()
                    .map_or(true, |kept| signal.timestamp > kept.timestamp);
                if keep {
                    newest = Some(signal);
                }
            }
            let Some(signal) = newest else { continue };

            self.events.emit(EngineEvent::SignalDetected {
                key: key.clone(),
                signal: signal.clone(),
            });

            let side = PositionSide::from_trade_side(signal.side);
            if current_side == Some(side) {
                // Already positioned this way; the tracker treats it as a
                // no-op, so sizing would be wasted work.
                accepted.push(AcceptedSignal {
                    signal,
                    sized_quantity: 0.0,
                });
                continue;
            }

            let decision = self.risk.check_and_size(&ProposedTrade {
                key: key.clone(),
                side,
                reference_price: signal.reference_price,
                strategy: signal.strategy.clone(),
            });
            if !decision.allowed {
                let err = EngineError::RiskBlocked {
                    violations: decision.violations,
                };
                warn!(key = %key, strategy = %signal.strategy, error = %err, "signal blocked");
                continue;
            }

            accepted.push(AcceptedSignal {
                signal,
                sized_quantity: decision.sized_quantity,
            });
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::models::{StrategyId, Timeframe, TradeSide};
    use crate::risk::{FixedFractionRiskGate, RiskDecision};
    use crate::strategy::Strategy;
    use chrono::{TimeZone, Utc};

    struct FixedSignals {
        id: &'static str,
        signals: Vec<Signal>,
    }

    impl Strategy for FixedSignals {
        fn id(&self) -> StrategyId {
            StrategyId::new(self.id)
        }

        fn evaluate(&self, _window: &[Candle]) -> crate::Result<Vec<Signal>> {
            Ok(self.signals.clone())
        }
    }

    struct DenyAll;

    impl RiskGate for DenyAll {
        fn check_and_size(&self, _proposed: &ProposedTrade) -> RiskDecision {
            RiskDecision::block(vec!["testing".to_string()])
        }
    }

    fn candle_at(minutes: i64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, minutes as u32, 0).unwrap(),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
        }
    }

    fn signal_at(minutes: i64, side: TradeSide) -> Signal {
        Signal {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, minutes as u32, 0).unwrap(),
            side,
            reference_price: 100.0,
            strategy: StrategyId::new("fixed"),
            reason: "test".to_string(),
        }
    }

    fn dispatcher(signals: Vec<Signal>, sink: Arc<MemorySink>) -> SignalDispatcher {
        let mut registry = StrategyRegistry::new();
        registry
            .register(Arc::new(FixedSignals {
                id: "fixed",
                signals,
            }))
            .unwrap();
        SignalDispatcher::new(
            registry,
            Arc::new(FixedFractionRiskGate::new(10_000.0, 0.05)),
            Duration::minutes(5),
            sink,
        )
    }

    fn key() -> MonitorKey {
        MonitorKey::new("acct", "x", "BTCUSDT", Timeframe::M1)
    }

    #[test]
    fn test_fresh_signal_is_sized_and_accepted() {
        let sink = Arc::new(MemorySink::new());
        let d = dispatcher(vec![signal_at(30, TradeSide::Buy)], sink.clone());
        let window = vec![candle_at(29), candle_at(30)];

        let accepted = d.dispatch(&key(), &window, None);
        assert_eq!(accepted.len(), 1);
        // 5% of 10000 equity at price 100.
        assert_eq!(accepted[0].sized_quantity, 5.0);
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::SignalDetected { .. })),
            1
        );
    }

    #[test]
    fn test_stale_signal_is_dropped() {
        let sink = Arc::new(MemorySink::new());
        // Signal from 12:20 against a 12:30 candle: 10 minutes stale.
        let d = dispatcher(vec![signal_at(20, TradeSide::Buy)], sink.clone());
        let window = vec![candle_at(30)];

        assert!(d.dispatch(&key(), &window, None).is_empty());
        assert_eq!(sink.events().len(), 0);
    }

    #[test]
    fn test_eligibility_rejections_name_the_strategy() {
        let d = dispatcher(Vec::new(), Arc::new(MemorySink::new()));
        let latest = candle_at(30);

        let ahead = d
            .eligibility(&signal_at(31, TradeSide::Buy), &latest)
            .unwrap_err();
        assert!(matches!(ahead, EngineError::StaleSignal { .. }));
        assert!(ahead.to_string().contains("fixed"));

        let behind = d
            .eligibility(&signal_at(20, TradeSide::Buy), &latest)
            .unwrap_err();
        assert!(matches!(behind, EngineError::StaleSignal { .. }));

        assert!(d.eligibility(&signal_at(28, TradeSide::Buy), &latest).is_ok());
    }

    #[test]
    fn test_future_signal_is_dropped() {
        let sink = Arc::new(MemorySink::new());
        let d = dispatcher(vec![signal_at(31, TradeSide::Buy)], sink.clone());
        let window = vec![candle_at(30)];

        assert!(d.dispatch(&key(), &window, None).is_empty());
    }

    #[test]
    fn test_most_recent_of_multiple_signals_wins() {
        let sink = Arc::new(MemorySink::new());
        let d = dispatcher(
            vec![signal_at(27, TradeSide::Sell), signal_at(29, TradeSide::Buy)],
            sink.clone(),
        );
        let window = vec![candle_at(30)];

        let accepted = d.dispatch(&key(), &window, None);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].signal.side, TradeSide::Buy);
    }

    #[test]
    fn test_same_side_signal_skips_risk_gate() {
        let sink = Arc::new(MemorySink::new());
        let mut registry = StrategyRegistry::new();
        registry
            .register(Arc::new(FixedSignals {
                id: "fixed",
                signals: vec![signal_at(30, TradeSide::Buy)],
            }))
            .unwrap();
        // DenyAll would block this signal if the gate were consulted.
        let d = SignalDispatcher::new(
            registry,
            Arc::new(DenyAll),
            Duration::minutes(5),
            sink,
        );
        let window = vec![candle_at(30)];

        let accepted = d.dispatch(&key(), &window, Some(PositionSide::Long));
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].sized_quantity, 0.0);
    }

    #[test]
    fn test_blocked_signal_is_logged_noop() {
        let sink = Arc::new(MemorySink::new());
        let mut registry = StrategyRegistry::new();
        registry
            .register(Arc::new(FixedSignals {
                id: "fixed",
                signals: vec![signal_at(30, TradeSide::Buy)],
            }))
            .unwrap();
        let d = SignalDispatcher::new(
            registry,
            Arc::new(DenyAll),
            Duration::minutes(5),
            sink.clone(),
        );
        let window = vec![candle_at(30)];

        assert!(d.dispatch(&key(), &window, None).is_empty());
        // Detection is still surfaced even when risk blocks it.
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::SignalDetected { .. })),
            1
        );
    }

    #[test]
    fn test_window_below_minimum_skips_strategy() {
        struct Needy;
        impl Strategy for Needy {
            fn id(&self) -> StrategyId {
                StrategyId::new("needy")
            }
            fn evaluate(&self, _window: &[Candle]) -> crate::Result<Vec<Signal>> {
                panic!("must not be evaluated below min_candles");
            }
            fn min_candles(&self) -> usize {
                50
            }
        }

        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(Needy)).unwrap();
        let d = SignalDispatcher::new(
            registry,
            Arc::new(FixedFractionRiskGate::new(10_000.0, 0.05)),
            Duration::minutes(5),
            Arc::new(MemorySink::new()),
        );

        assert!(d.dispatch(&key(), &[candle_at(30)], None).is_empty());
    }
}
