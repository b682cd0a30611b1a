//! Market monitors: one long-running task per (account, exchange, market,
//! timeframe), polling for newly closed candles and driving the evaluation
//! cycle.

pub mod registry;
pub mod window;

pub use registry::MonitorRegistry;
pub use window::CandleWindow;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{AcceptedSignal, SignalDispatcher};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::gateway::{CancelFlag, OrderGateway};
use crate::models::{MonitorKey, OrderIntent, OrderRequest, PositionSide};
use crate::position::{ExitIntent, ExitReason, ExitRules, Position, PositionTracker, PositionTransition};
use crate::store::PositionStore;

/// Per-monitor tuning knobs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Candles fetched to seed the window before the first cycle.
    pub initial_lookback: usize,
    pub window_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_lookback: 100,
            window_capacity: 200,
        }
    }
}

/// Everything a monitor task needs besides its key. Cloned per monitor so
/// siblings share the gateway (and thus the per-exchange breaker) and store.
pub struct MonitorDeps {
    pub gateway: Arc<OrderGateway>,
    pub store: Arc<dyn PositionStore>,
    pub events: Arc<dyn EventSink>,
    pub dispatcher: Arc<SignalDispatcher>,
    pub rules: ExitRules,
    pub config: MonitorConfig,
}

/// A durable write the monitor owes the position store. Queued in lifecycle
/// order so a failed write is replayed before anything that depends on it;
/// transition ids make a replayed write that actually landed a no-op.
enum StoreWrite {
    Create(Position),
    Transition(PositionTransition),
    Close {
        id: Uuid,
        exit_price: f64,
        reason: ExitReason,
    },
}

pub struct MarketMonitor {
    key: MonitorKey,
    deps: MonitorDeps,
    window: CandleWindow,
    tracker: PositionTracker,
    cancel: CancelFlag,
    pending_writes: VecDeque<StoreWrite>,
}

impl MarketMonitor {
    pub fn new(key: MonitorKey, deps: MonitorDeps, cancel: CancelFlag) -> Self {
        let window = CandleWindow::new(deps.config.window_capacity);
        let tracker = PositionTracker::new(key.clone(), deps.rules.clone());
        Self {
            key,
            deps,
            window,
            tracker,
            cancel,
            pending_writes: VecDeque::new(),
        }
    }

    /// Queue a store write and try to drain the queue in order. The tracker
    /// is the source of truth; a failed write stays queued so the durable
    /// record catches up instead of version-conflicting forever. In
    /// particular a terminal close is never written while a partial-close
    /// transition before it is still unpersisted.
    async fn persist(&mut self, write: StoreWrite) {
        self.pending_writes.push_back(write);
        self.flush_store_writes().await;
    }

    async fn flush_store_writes(&mut self) {
        while let Some(write) = self.pending_writes.front() {
            let result = match write {
                StoreWrite::Create(position) => self.deps.store.create(position).await,
                StoreWrite::Transition(transition) => {
                    self.deps.store.apply_transition(transition).await
                }
                StoreWrite::Close {
                    id,
                    exit_price,
                    reason,
                } => self.deps.store.close(*id, *exit_price, *reason).await,
            };
            match result {
                Ok(()) => {
                    self.pending_writes.pop_front();
                }
                Err(err) => {
                    warn!(
                        key = %self.key,
                        pending = self.pending_writes.len(),
                        error = %err,
                        "store write failed, will replay"
                    );
                    break;
                }
            }
        }
    }

    /// Task body. Runs until cancelled; fetch failures and open breakers only
    /// cost the current cycle.
    pub async fn run(mut self) {
        info!(key = %self.key, "monitor started");
        if let Err(err) = self.seed().await {
            warn!(key = %self.key, error = %err, "initial window seed failed, will backfill while polling");
        }

        let interval = self.key.timeframe.poll_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => break,
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.poll_once().await;
        }
        info!(key = %self.key, "monitor stopped");
    }

    async fn seed(&mut self) -> Result<(), EngineError> {
        let candles = self
            .deps
            .gateway
            .fetch_candles(&self.key, self.deps.config.initial_lookback)
            .await?;
        if candles.is_empty() {
            return Err(EngineError::DataGap(
                "no candles returned for initial lookback".to_string(),
            ));
        }
        for candle in candles {
            self.window.push(candle);
        }
        debug!(key = %self.key, candles = self.window.len(), "window seeded");

        // Reconcile against the exchange: exposure this engine did not open
        // is left alone, but it is worth a loud line at startup.
        match self.deps.gateway.open_positions(&self.key.symbol).await {
            Ok(existing) if !existing.is_empty() => {
                for p in existing {
                    warn!(
                        key = %self.key,
                        side = %p.side,
                        quantity = p.quantity,
                        avg_entry_price = p.avg_entry_price,
                        "unmanaged exchange exposure at startup"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(key = %self.key, error = %err, "could not reconcile open positions");
            }
        }
        Ok(())
    }

    /// Candles to request on a poll. Two (the forming candle plus the latest
    /// closed one) in steady state; the full lookback when the window is
    /// still short after a failed seed, or stale after a long fetch outage,
    /// so gaps get backfilled instead of persisting.
    fn fetch_limit(&self) -> usize {
        let lookback = self
            .deps
            .config
            .initial_lookback
            .min(self.deps.config.window_capacity)
            .max(2);
        let Some(last) = self.window.last() else {
            return lookback;
        };
        if self.window.len() < lookback {
            return lookback;
        }
        let interval = chrono::Duration::from_std(self.key.timeframe.duration())
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        // The newest closed candle opened at most two intervals ago.
        if Utc::now() - last.open_time > interval * 3 {
            return lookback;
        }
        2
    }

    /// One poll: fetch the most recent candles and, if a newer closed candle
    /// appeared, run exactly one evaluation cycle for it.
    pub async fn poll_once(&mut self) {
        // Owed store writes drain before anything new happens this cycle.
        self.flush_store_writes().await;

        let limit = self.fetch_limit();
        let candles = match self.deps.gateway.fetch_candles(&self.key, limit).await {
            Ok(candles) => candles,
            Err(EngineError::BreakerOpen(breaker)) => {
                debug!(key = %self.key, breaker, "breaker open, skipping cycle");
                return;
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "candle fetch failed, skipping cycle");
                return;
            }
        };

        let mut appended = false;
        for candle in candles {
            appended |= self.window.push(candle);
        }
        if !appended {
            // No newer closed candle yet; wait for the next poll.
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        self.evaluate_cycle().await;
    }

    /// Evaluation cycle for the latest closed candle: exit obligations first,
    /// then fresh signals.
    async fn evaluate_cycle(&mut self) {
        let Some(latest) = self.window.last().cloned() else {
            return;
        };
        let close = latest.close;

        self.handle_exits(close).await;
        if self.cancel.is_cancelled() {
            return;
        }

        let side = self.tracker.current_side();
        let accepted = self
            .deps
            .dispatcher
            .dispatch(&self.key, self.window.as_slice(), side);
        for signal in accepted {
            if self.cancel.is_cancelled() {
                return;
            }
            self.handle_entry(signal).await;
        }

        debug!(
            key = %self.key,
            close,
            window = self.window.len(),
            position = ?self.tracker.current().map(|p| p.state),
            "cycle complete"
        );
    }

    async fn handle_exits(&mut self, price: f64) {
        let update = self.tracker.observe_price(price);

        if let Some(transition) = update.transition {
            self.persist(StoreWrite::Transition(transition)).await;
        }

        let Some(intent) = update.exit else { return };
        let Some(position) = self.tracker.current() else {
            return;
        };
        let request = OrderRequest::new(
            self.key.clone(),
            position.side.close_side(),
            intent.quantity,
            intent.intent,
        );

        match self.deps.gateway.execute(&request, &self.cancel).await {
            Ok(fill) => self.confirm_exit(&intent, &fill).await,
            Err(EngineError::Cancelled) => {}
            Err(err) => {
                // Position state untouched; the obligation re-fires on the
                // next observation.
                warn!(key = %self.key, intent = ?intent.intent, error = %err, "exit order failed");
            }
        }
    }

    async fn confirm_exit(&mut self, intent: &ExitIntent, fill: &crate::models::OrderFill) {
        let Some((transition, closed)) = self.tracker.apply_exit(intent, fill) else {
            return;
        };

        match closed {
            Some(position) => {
                let reason = position.exit_reason.unwrap_or(ExitReason::StopLoss);
                self.persist(StoreWrite::Close {
                    id: position.id,
                    exit_price: fill.avg_price,
                    reason,
                })
                .await;
                self.deps.events.emit(EngineEvent::PositionClosed {
                    key: self.key.clone(),
                    position_id: position.id,
                    exit_price: fill.avg_price,
                    reason,
                });
            }
            None => {
                let position_id = transition.position_id;
                let remaining_qty = transition.remaining_quantity;
                self.persist(StoreWrite::Transition(transition)).await;
                self.deps.events.emit(EngineEvent::PositionPartialClosed {
                    key: self.key.clone(),
                    position_id,
                    closed_qty: fill.filled_qty,
                    price: fill.avg_price,
                    remaining_qty,
                });
            }
        }
    }

    async fn handle_entry(&mut self, accepted: AcceptedSignal) {
        let side = PositionSide::from_trade_side(accepted.signal.side);
        let Some(plan) = self.tracker.plan_entry(side) else {
            debug!(key = %self.key, side = %side, "signal matches current exposure, no-op");
            return;
        };

        if let crate::position::EntryPlan::FlipClose { close_quantity } = plan {
            let Some(existing) = self.tracker.current() else {
                return;
            };
            let request = OrderRequest::new(
                self.key.clone(),
                existing.side.close_side(),
                close_quantity,
                OrderIntent::CloseOpposite,
            );
            match self.deps.gateway.execute(&request, &self.cancel).await {
                Ok(fill) => {
                    if let Some(transition) = self.tracker.apply_flip_close(&fill) {
                        self.persist(StoreWrite::Close {
                            id: transition.position_id,
                            exit_price: fill.avg_price,
                            reason: ExitReason::OppositeSignal,
                        })
                        .await;
                        self.deps.events.emit(EngineEvent::PositionClosed {
                            key: self.key.clone(),
                            position_id: transition.position_id,
                            exit_price: fill.avg_price,
                            reason: ExitReason::OppositeSignal,
                        });
                    }
                }
                Err(EngineError::Cancelled) => return,
                Err(err) => {
                    warn!(key = %self.key, error = %err, "flip close failed, entry abandoned");
                    return;
                }
            }
        }

        if accepted.sized_quantity <= 0.0 {
            return;
        }
        let request = OrderRequest::new(
            self.key.clone(),
            side.entry_side(),
            accepted.sized_quantity,
            OrderIntent::Entry,
        );
        match self.deps.gateway.execute(&request, &self.cancel).await {
            Ok(fill) => {
                let position = self.tracker.confirm_open(side, &fill).clone();
                self.persist(StoreWrite::Create(position.clone())).await;
                self.deps.events.emit(EngineEvent::PositionOpened {
                    key: self.key.clone(),
                    position_id: position.id,
                    entry_price: fill.avg_price,
                    quantity: fill.filled_qty,
                });
            }
            Err(EngineError::Cancelled) => {}
            Err(err) => {
                warn!(key = %self.key, strategy = %accepted.signal.strategy, error = %err, "entry order failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn position_state(&self) -> Option<crate::position::PositionState> {
        self.tracker.current().map(|p| p.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::exchange::sim::SimulatedExchange;
    use crate::gateway::{CircuitBreaker, CircuitBreakerConfig, GatewayConfig};
    use crate::models::{Candle, Signal, StrategyId, Timeframe, TradeSide};
    use crate::models::{OrderFill, OrderStatus};
    use crate::position::PositionState;
    use crate::risk::FixedFractionRiskGate;
    use crate::store::MemoryPositionStore;
    use crate::strategy::{Strategy, StrategyRegistry};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits a buy signal on the latest candle, once.
    struct BuyOnce {
        fired: std::sync::atomic::AtomicBool,
    }

    impl BuyOnce {
        fn new() -> Self {
            Self {
                fired: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl Strategy for BuyOnce {
        fn id(&self) -> StrategyId {
            StrategyId::new("buy-once")
        }

        fn evaluate(&self, window: &[Candle]) -> crate::Result<Vec<Signal>> {
            if self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            let latest = window.last().expect("non-empty window");
            Ok(vec![Signal {
                timestamp: latest.open_time,
                side: TradeSide::Buy,
                reference_price: latest.close,
                strategy: self.id(),
                reason: "test".to_string(),
            }])
        }
    }

    fn build_monitor(
        sink: Arc<MemorySink>,
        exchange: Arc<SimulatedExchange>,
    ) -> (MarketMonitor, CancelFlag, Arc<MemoryPositionStore>) {
        let store = Arc::new(MemoryPositionStore::new());
        let (monitor, cancel) = monitor_with_store(sink, exchange, store.clone());
        (monitor, cancel, store)
    }

    fn monitor_with_store(
        sink: Arc<MemorySink>,
        exchange: Arc<SimulatedExchange>,
        store: Arc<dyn PositionStore>,
    ) -> (MarketMonitor, CancelFlag) {
        let key = MonitorKey::new("acct", "sim", "BTCUSDT", Timeframe::M1);
        let breaker = Arc::new(CircuitBreaker::new("sim", CircuitBreakerConfig::default()));
        let gateway = Arc::new(OrderGateway::new(
            exchange,
            breaker,
            GatewayConfig::default(),
            sink.clone(),
        ));
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(BuyOnce::new())).unwrap();
        let dispatcher = Arc::new(SignalDispatcher::new(
            registry,
            Arc::new(FixedFractionRiskGate::new(100_000.0, 0.05)),
            ChronoDuration::minutes(5),
            sink.clone(),
        ));
        let cancel = CancelFlag::new();
        let deps = MonitorDeps {
            gateway,
            store,
            events: sink,
            dispatcher,
            rules: ExitRules::default(),
            config: MonitorConfig::default(),
        };
        let monitor = MarketMonitor::new(key, deps, cancel.clone());
        (monitor, cancel)
    }

    #[tokio::test]
    async fn test_seed_then_signal_opens_position() {
        let sink = Arc::new(MemorySink::new());
        let exchange = Arc::new(SimulatedExchange::new(7).with_symbol("BTCUSDT", 50_000.0));
        let (mut monitor, _cancel, store) = build_monitor(sink.clone(), exchange);

        monitor.seed().await.unwrap();
        assert!(monitor.window.len() > 0);

        monitor.evaluate_cycle().await;

        assert_eq!(monitor.position_state(), Some(PositionState::Open));
        assert_eq!(store.open_positions().await.unwrap().len(), 1);
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::PositionOpened { .. })),
            1
        );
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::OrderSubmitted { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_evaluation_without_new_candle_is_skipped() {
        let sink = Arc::new(MemorySink::new());
        let exchange = Arc::new(SimulatedExchange::new(7).with_symbol("BTCUSDT", 50_000.0));
        let (mut monitor, _cancel, _store) = build_monitor(sink.clone(), exchange);

        monitor.seed().await.unwrap();
        // Poll immediately: the exchange has no newer closed candle, so no
        // evaluation happens and no signal fires.
        monitor.poll_once().await;
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::SignalDetected { .. })),
            0
        );
    }

    /// Store that loses a scripted number of transition writes, as a flaky
    /// backend would.
    struct FlakyStore {
        inner: MemoryPositionStore,
        dropped_transitions: AtomicUsize,
    }

    impl FlakyStore {
        fn dropping_transitions(count: usize) -> Self {
            Self {
                inner: MemoryPositionStore::new(),
                dropped_transitions: AtomicUsize::new(count),
            }
        }
    }

    #[async_trait]
    impl PositionStore for FlakyStore {
        async fn create(&self, position: &crate::position::Position) -> crate::Result<()> {
            self.inner.create(position).await
        }

        async fn apply_transition(&self, transition: &PositionTransition) -> crate::Result<()> {
            let drop_this = self
                .dropped_transitions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if drop_this {
                return Err(EngineError::store("write lost"));
            }
            self.inner.apply_transition(transition).await
        }

        async fn close(
            &self,
            id: Uuid,
            exit_price: f64,
            reason: ExitReason,
        ) -> crate::Result<()> {
            self.inner.close(id, exit_price, reason).await
        }

        async fn open_positions(&self) -> crate::Result<Vec<crate::position::Position>> {
            self.inner.open_positions().await
        }

        async fn get(&self, id: Uuid) -> crate::Result<Option<crate::position::Position>> {
            self.inner.get(id).await
        }
    }

    fn fill(price: f64, qty: f64) -> OrderFill {
        OrderFill {
            order_id: "t".to_string(),
            avg_price: price,
            filled_qty: qty,
            status: OrderStatus::Filled,
        }
    }

    // One lost transition write must not desync the durable record: the
    // queued write replays before later writes, so the terminal record keeps
    // its partial-close history and the version chain stays intact.
    #[tokio::test]
    async fn test_dropped_store_write_replays_before_later_writes() {
        let sink = Arc::new(MemorySink::new());
        let exchange = Arc::new(SimulatedExchange::new(7).with_symbol("BTCUSDT", 50_000.0));
        let store = Arc::new(FlakyStore::dropping_transitions(1));
        let (mut monitor, _cancel) = monitor_with_store(sink, exchange, store.clone());

        let position = monitor
            .tracker
            .confirm_open(PositionSide::Long, &fill(50_000.0, 1.0))
            .clone();
        monitor.persist(StoreWrite::Create(position.clone())).await;

        // First target fires; the store drops this write.
        let intent = monitor.tracker.observe_price(55_000.0).exit.unwrap();
        let (transition, closed) = monitor
            .tracker
            .apply_exit(&intent, &fill(55_000.0, 0.5))
            .unwrap();
        assert!(closed.is_none());
        monitor.persist(StoreWrite::Transition(transition)).await;

        let durable = store.inner.get(position.id).await.unwrap().unwrap();
        assert_eq!(durable.version, 1);
        assert!(durable.partial_closes.is_empty());

        // Trailing housekeeping, then the trailing stop closes the rest. The
        // queued partial-close write must land first.
        let update = monitor.tracker.observe_price(57_000.0);
        monitor
            .persist(StoreWrite::Transition(update.transition.unwrap()))
            .await;
        let intent = monitor.tracker.observe_price(54_720.0).exit.unwrap();
        let (_, closed) = monitor
            .tracker
            .apply_exit(&intent, &fill(54_720.0, 0.5))
            .unwrap();
        let closed = closed.unwrap();
        monitor
            .persist(StoreWrite::Close {
                id: closed.id,
                exit_price: 54_720.0,
                reason: ExitReason::TrailingStop,
            })
            .await;

        assert!(monitor.pending_writes.is_empty());
        let durable = store.inner.get(position.id).await.unwrap().unwrap();
        assert_eq!(durable.state, PositionState::Closed);
        assert_eq!(durable.partial_closes.len(), 1);
        assert_eq!(durable.remaining_quantity, 0.0);
        assert_eq!(durable.version, 4);
    }

    #[tokio::test]
    async fn test_poll_backfills_window_after_failed_seed() {
        let sink = Arc::new(MemorySink::new());
        let exchange = Arc::new(SimulatedExchange::new(7).with_symbol("BTCUSDT", 50_000.0));
        let (mut monitor, _cancel, _store) = build_monitor(sink, exchange);

        // Seed never ran, so the first poll must fetch the full lookback
        // rather than the steady-state two candles.
        assert_eq!(monitor.fetch_limit(), monitor.deps.config.initial_lookback);
        monitor.poll_once().await;
        assert!(monitor.window.len() >= monitor.deps.config.initial_lookback);

        // With a fresh, full window the next poll is back to two.
        assert_eq!(monitor.fetch_limit(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_monitor_exits_loop() {
        let sink = Arc::new(MemorySink::new());
        let exchange = Arc::new(SimulatedExchange::new(7).with_symbol("BTCUSDT", 50_000.0));
        let (monitor, cancel, _store) = build_monitor(sink, exchange);

        let handle = tokio::spawn(monitor.run());
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("monitor task must observe cancellation")
            .unwrap();
    }
}
