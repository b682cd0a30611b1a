//! Position persistence.
//!
//! The engine writes every lifecycle step through [`PositionStore`] so a
//! restart can recover open positions. Writes carry the position's expected
//! version and a transition id: the version check rejects lost updates, the
//! transition id makes a retried write a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::position::{ExitReason, Position, PositionState, PositionTransition};
use crate::Result;

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persist a newly opened position.
    async fn create(&self, position: &Position) -> Result<()>;

    /// Apply a non-terminal transition, compare-and-setting on
    /// `expected_version`. Re-applying the same `transition_id` succeeds
    /// without effect.
    async fn apply_transition(&self, transition: &PositionTransition) -> Result<()>;

    /// Terminal write: mark the position closed. Idempotent, a repeated
    /// close of an already-closed position is a no-op.
    async fn close(&self, id: Uuid, exit_price: f64, reason: ExitReason) -> Result<()>;

    /// Open (non-terminal) positions, for recovery at startup.
    async fn open_positions(&self) -> Result<Vec<Position>>;

    async fn get(&self, id: Uuid) -> Result<Option<Position>>;
}

#[derive(Default)]
struct StoreInner {
    positions: HashMap<Uuid, Position>,
    applied: HashSet<Uuid>,
}

/// In-memory store backing the engine and its tests.
#[derive(Default)]
pub struct MemoryPositionStore {
    inner: Mutex<StoreInner>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored position, closed ones included.
    pub fn all(&self) -> Vec<Position> {
        let inner = self.inner.lock().expect("store lock");
        inner.positions.values().cloned().collect()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create(&self, position: &Position) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        if inner.positions.contains_key(&position.id) {
            return Err(EngineError::store(format!(
                "position {} already exists",
                position.id
            )));
        }
        inner.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn apply_transition(&self, transition: &PositionTransition) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        if inner.applied.contains(&transition.transition_id) {
            return Ok(());
        }
        let position = inner
            .positions
            .get_mut(&transition.position_id)
            .ok_or_else(|| {
                EngineError::store(format!("unknown position {}", transition.position_id))
            })?;
        if position.version != transition.expected_version {
            return Err(EngineError::store(format!(
                "version conflict on position {}: have {}, transition expects {}",
                transition.position_id, position.version, transition.expected_version
            )));
        }

        position.state = transition.new_state;
        position.remaining_quantity = transition.remaining_quantity;
        position.high_water_mark = transition.high_water_mark;
        position.trailing_armed = transition.trailing_armed;
        position.last_transition_at = transition.at;
        if let Some(partial) = &transition.partial_close {
            position.partial_closes.push(partial.clone());
        }
        if let Some((price, reason)) = transition.exit {
            position.exit_price = Some(price);
            position.exit_reason = Some(reason);
        }
        position.version += 1;

        inner.applied.insert(transition.transition_id);
        Ok(())
    }

    async fn close(&self, id: Uuid, exit_price: f64, reason: ExitReason) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let position = inner
            .positions
            .get_mut(&id)
            .ok_or_else(|| EngineError::store(format!("unknown position {id}")))?;
        if position.state == PositionState::Closed {
            return Ok(());
        }
        position.state = PositionState::Closed;
        position.remaining_quantity = 0.0;
        position.exit_price = Some(exit_price);
        position.exit_reason = Some(reason);
        position.version += 1;
        position.last_transition_at = chrono::Utc::now();
        Ok(())
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .positions
            .values()
            .filter(|p| p.state != PositionState::Closed)
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.positions.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonitorKey, OrderFill, OrderStatus, PositionSide, Timeframe};
    use crate::position::{ExitRules, PositionTracker};

    fn opened_position() -> (PositionTracker, Position) {
        let mut tracker = PositionTracker::new(
            MonitorKey::new("acct", "x", "BTCUSDT", Timeframe::M5),
            ExitRules::default(),
        );
        let fill = OrderFill {
            order_id: "1".to_string(),
            avg_price: 50_000.0,
            filled_qty: 1.0,
            status: OrderStatus::Filled,
        };
        let position = tracker.confirm_open(PositionSide::Long, &fill).clone();
        (tracker, position)
    }

    #[tokio::test]
    async fn test_create_and_recover_open_positions() {
        let store = MemoryPositionStore::new();
        let (_, position) = opened_position();
        store.create(&position).await.unwrap();

        let open = store.open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, position.id);

        assert!(store.create(&position).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_advances_version() {
        let store = MemoryPositionStore::new();
        let (mut tracker, position) = opened_position();
        store.create(&position).await.unwrap();

        let intent = tracker.observe_price(55_000.0).exit.unwrap();
        let fill = OrderFill {
            order_id: "2".to_string(),
            avg_price: 55_000.0,
            filled_qty: 0.5,
            status: OrderStatus::Filled,
        };
        let (transition, _) = tracker.apply_exit(&intent, &fill).unwrap();
        store.apply_transition(&transition).await.unwrap();

        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.remaining_quantity, 0.5);
        assert_eq!(stored.partial_closes.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryPositionStore::new();
        let (mut tracker, position) = opened_position();
        store.create(&position).await.unwrap();

        let intent = tracker.observe_price(55_000.0).exit.unwrap();
        let fill = OrderFill {
            order_id: "2".to_string(),
            avg_price: 55_000.0,
            filled_qty: 0.5,
            status: OrderStatus::Filled,
        };
        let (transition, _) = tracker.apply_exit(&intent, &fill).unwrap();
        store.apply_transition(&transition).await.unwrap();

        // A second writer with the same expected version loses.
        let mut stale = transition.clone();
        stale.transition_id = Uuid::new_v4();
        let err = store.apply_transition(&stale).await.unwrap_err();
        assert!(err.to_string().contains("version conflict"));
    }

    #[tokio::test]
    async fn test_repeated_transition_id_is_noop() {
        let store = MemoryPositionStore::new();
        let (mut tracker, position) = opened_position();
        store.create(&position).await.unwrap();

        let intent = tracker.observe_price(55_000.0).exit.unwrap();
        let fill = OrderFill {
            order_id: "2".to_string(),
            avg_price: 55_000.0,
            filled_qty: 0.5,
            status: OrderStatus::Filled,
        };
        let (transition, _) = tracker.apply_exit(&intent, &fill).unwrap();
        store.apply_transition(&transition).await.unwrap();
        // Retried write after an ambiguous ack.
        store.apply_transition(&transition).await.unwrap();

        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.partial_closes.len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = MemoryPositionStore::new();
        let (_, position) = opened_position();
        store.create(&position).await.unwrap();

        store
            .close(position.id, 47_500.0, ExitReason::StopLoss)
            .await
            .unwrap();
        store
            .close(position.id, 47_500.0, ExitReason::StopLoss)
            .await
            .unwrap();

        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.state, PositionState::Closed);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.exit_reason, Some(ExitReason::StopLoss));
        assert!(store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_positions_drop_out_of_recovery() {
        let store = MemoryPositionStore::new();
        let (mut tracker, position) = opened_position();
        store.create(&position).await.unwrap();

        let intent = tracker.observe_price(47_000.0).exit.unwrap();
        let fill = OrderFill {
            order_id: "3".to_string(),
            avg_price: 47_000.0,
            filled_qty: 1.0,
            status: OrderStatus::Filled,
        };
        let (transition, closed) = tracker.apply_exit(&intent, &fill).unwrap();
        assert!(closed.is_some());
        store.apply_transition(&transition).await.unwrap();

        assert!(store.open_positions().await.unwrap().is_empty());
    }
}
