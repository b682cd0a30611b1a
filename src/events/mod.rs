use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MonitorKey, OrderIntent, Signal, TradeSide};
use crate::position::ExitReason;

/// Structured events handed to the observability sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SignalDetected {
        key: MonitorKey,
        signal: Signal,
    },
    OrderSubmitted {
        key: MonitorKey,
        correlation_id: Uuid,
        side: TradeSide,
        quantity: f64,
        intent: OrderIntent,
        avg_price: f64,
    },
    OrderFailed {
        key: MonitorKey,
        correlation_id: Uuid,
        intent: OrderIntent,
        error: String,
    },
    PositionOpened {
        key: MonitorKey,
        position_id: Uuid,
        entry_price: f64,
        quantity: f64,
    },
    PositionPartialClosed {
        key: MonitorKey,
        position_id: Uuid,
        closed_qty: f64,
        price: f64,
        remaining_qty: f64,
    },
    PositionClosed {
        key: MonitorKey,
        position_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
    },
    BreakerOpened {
        breaker: String,
        consecutive_failures: u32,
    },
    BreakerClosed {
        breaker: String,
    },
}

/// Observability sink. Implementations must be cheap and non-blocking; the
/// engine emits from inside evaluation cycles.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Default sink: structured tracing output.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::SignalDetected { key, signal } => {
                tracing::info!(
                    key = %key,
                    strategy = %signal.strategy,
                    side = %signal.side,
                    price = signal.reference_price,
                    "signal detected"
                );
            }
            EngineEvent::OrderSubmitted {
                key,
                correlation_id,
                side,
                quantity,
                avg_price,
                intent,
            } => {
                tracing::info!(
                    key = %key,
                    correlation_id = %correlation_id,
                    side = %side,
                    quantity,
                    avg_price,
                    ?intent,
                    "order submitted"
                );
            }
            EngineEvent::OrderFailed {
                key,
                correlation_id,
                intent,
                error,
            } => {
                tracing::warn!(
                    key = %key,
                    correlation_id = %correlation_id,
                    ?intent,
                    error,
                    "order failed"
                );
            }
            EngineEvent::PositionOpened {
                key,
                position_id,
                entry_price,
                quantity,
            } => {
                tracing::info!(
                    key = %key,
                    position_id = %position_id,
                    entry_price,
                    quantity,
                    "position opened"
                );
            }
            EngineEvent::PositionPartialClosed {
                key,
                position_id,
                closed_qty,
                price,
                remaining_qty,
            } => {
                tracing::info!(
                    key = %key,
                    position_id = %position_id,
                    closed_qty,
                    price,
                    remaining_qty,
                    "position partially closed"
                );
            }
            EngineEvent::PositionClosed {
                key,
                position_id,
                exit_price,
                reason,
            } => {
                tracing::info!(
                    key = %key,
                    position_id = %position_id,
                    exit_price,
                    ?reason,
                    "position closed"
                );
            }
            EngineEvent::BreakerOpened {
                breaker,
                consecutive_failures,
            } => {
                tracing::warn!(breaker, consecutive_failures, "circuit breaker opened");
            }
            EngineEvent::BreakerClosed { breaker } => {
                tracing::info!(breaker, "circuit breaker closed");
            }
        }
    }
}

/// Sink that records every event in memory. Used in tests and available to
/// embedders that want to tee events.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(DateTime<Utc>, EngineEvent)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&EngineEvent) -> bool,
    {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| predicate(e))
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push((Utc::now(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;

    #[test]
    fn test_memory_sink_records_events() {
        let sink = MemorySink::new();
        sink.emit(EngineEvent::BreakerOpened {
            breaker: "binance".to_string(),
            consecutive_failures: 5,
        });
        sink.emit(EngineEvent::BreakerClosed {
            breaker: "binance".to_string(),
        });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::BreakerOpened { .. })),
            1
        );
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let key = MonitorKey::new("a", "x", "BTCUSDT", Timeframe::M5);
        let event = EngineEvent::PositionOpened {
            key,
            position_id: Uuid::new_v4(),
            entry_price: 50_000.0,
            quantity: 1.0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"position_opened\""));
    }
}
