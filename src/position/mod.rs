use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MonitorKey, OrderFill, OrderIntent, PositionSide};

/// Exit thresholds applied to every position a monitor opens, expressed as
/// fractions of the entry price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRules {
    pub stop_loss_pct: f64,
    pub take_profit_1_pct: f64,
    /// Fraction of the remaining quantity closed at the first target.
    pub take_profit_1_fraction: f64,
    pub take_profit_2_pct: f64,
    /// Retracement from the high-water mark that fires the trailing stop.
    pub trailing_callback_pct: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.05,
            take_profit_1_pct: 0.10,
            take_profit_1_fraction: 0.5,
            take_profit_2_pct: 0.15,
            trailing_callback_pct: 0.04,
        }
    }
}

impl ExitRules {
    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        let in_unit = |v: f64| v > 0.0 && v < 1.0;
        if !in_unit(self.stop_loss_pct)
            || !in_unit(self.take_profit_1_pct)
            || !in_unit(self.take_profit_1_fraction)
            || !in_unit(self.take_profit_2_pct)
            || !in_unit(self.trailing_callback_pct)
        {
            return Err(crate::error::EngineError::config(
                "exit rule percentages must lie strictly between 0 and 1",
            ));
        }
        if self.take_profit_2_pct <= self.take_profit_1_pct {
            return Err(crate::error::EngineError::config(
                "take-profit-2 must be beyond take-profit-1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Opening,
    Open,
    PartialTpDone,
    Trailing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit2,
    OppositeSignal,
}

/// A realized partial close. `remaining_quantity` only ever decreases through
/// these records, except for terminal full closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialClose {
    pub quantity: f64,
    pub price: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub key: MonitorKey,
    pub side: PositionSide,
    pub entry_price: f64,
    pub original_quantity: f64,
    pub remaining_quantity: f64,
    /// Threshold fractions. Obligations compare the position's signed return
    /// against these; the derived price levels below are kept for reporting.
    pub rules: ExitRules,
    pub stop_loss_price: f64,
    pub take_profit_1_price: f64,
    pub take_profit_2_price: f64,
    pub trailing_armed: bool,
    pub high_water_mark: f64,
    pub state: PositionState,
    /// Bumped on every transition; the store compare-and-sets on it.
    pub version: u64,
    pub partial_closes: Vec<PartialClose>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl Position {
    /// Signed-return helper: positive when price moved in the position's
    /// favor.
    pub fn favorable_return(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - price) / self.entry_price,
        }
    }

    fn stop_breached(&self, price: f64) -> bool {
        self.favorable_return(price) <= -self.rules.stop_loss_pct
    }

    fn tp1_reached(&self, price: f64) -> bool {
        self.favorable_return(price) >= self.rules.take_profit_1_pct
    }

    fn tp2_reached(&self, price: f64) -> bool {
        self.favorable_return(price) >= self.rules.take_profit_2_pct
    }

    fn is_new_extreme(&self, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price > self.high_water_mark,
            PositionSide::Short => price < self.high_water_mark,
        }
    }

    fn retraced_past_callback(&self, price: f64) -> bool {
        let retrace = match self.side {
            PositionSide::Long => (self.high_water_mark - price) / self.high_water_mark,
            PositionSide::Short => (price - self.high_water_mark) / self.high_water_mark,
        };
        retrace >= self.rules.trailing_callback_pct
    }
}

/// Exit order the monitor must place for the current candle.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitIntent {
    pub intent: OrderIntent,
    pub quantity: f64,
}

/// Record of one state-machine step, applied to the position store with
/// compare-and-set on `expected_version` so a retried write cannot
/// double-apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionTransition {
    pub transition_id: Uuid,
    pub position_id: Uuid,
    pub expected_version: u64,
    pub new_state: PositionState,
    pub remaining_quantity: f64,
    pub high_water_mark: f64,
    pub trailing_armed: bool,
    pub partial_close: Option<PartialClose>,
    pub exit: Option<(f64, ExitReason)>,
    pub at: DateTime<Utc>,
}

/// What a price observation requires of the monitor.
#[derive(Debug, Clone, Default)]
pub struct PriceUpdate {
    /// A housekeeping transition (PARTIAL_TP_DONE -> TRAILING) to persist.
    pub transition: Option<PositionTransition>,
    /// An exit order to place, if an obligation fired.
    pub exit: Option<ExitIntent>,
}

/// How the monitor should stage an accepted entry signal.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPlan {
    /// No exposure yet: open directly.
    OpenNew,
    /// Opposing exposure exists: flat-close it first, then open.
    FlipClose { close_quantity: f64 },
}

/// Owns the lifecycle of at most one position per monitor key.
///
/// The tracker never talks to the exchange. It plans orders, and mutates its
/// position only when the monitor confirms a fill, so a failed submission
/// leaves the prior state and its protective obligations intact.
pub struct PositionTracker {
    key: MonitorKey,
    rules: ExitRules,
    position: Option<Position>,
}

impl PositionTracker {
    pub fn new(key: MonitorKey, rules: ExitRules) -> Self {
        Self {
            key,
            rules,
            position: None,
        }
    }

    pub fn current(&self) -> Option<&Position> {
        self.position
            .as_ref()
            .filter(|p| p.state != PositionState::Closed)
    }

    pub fn current_side(&self) -> Option<PositionSide> {
        self.current().map(|p| p.side)
    }

    /// Decide how to stage an entry in `side` direction. `None` means the
    /// signal matches existing exposure and is a no-op.
    pub fn plan_entry(&self, side: PositionSide) -> Option<EntryPlan> {
        match self.current() {
            None => Some(EntryPlan::OpenNew),
            Some(p) if p.side == side => None,
            Some(p) => Some(EntryPlan::FlipClose {
                close_quantity: p.remaining_quantity,
            }),
        }
    }

    /// Close the opposing position after its flat-close order filled.
    pub fn apply_flip_close(&mut self, fill: &OrderFill) -> Option<PositionTransition> {
        let position = self.position.as_mut()?;
        if position.state == PositionState::Closed {
            return None;
        }
        let expected_version = position.version;
        let now = Utc::now();
        position.state = PositionState::Closed;
        position.remaining_quantity = 0.0;
        position.exit_price = Some(fill.avg_price);
        position.exit_reason = Some(ExitReason::OppositeSignal);
        position.version += 1;
        position.last_transition_at = now;
        let transition = PositionTransition {
            transition_id: Uuid::new_v4(),
            position_id: position.id,
            expected_version,
            new_state: PositionState::Closed,
            remaining_quantity: 0.0,
            high_water_mark: position.high_water_mark,
            trailing_armed: position.trailing_armed,
            partial_close: None,
            exit: Some((fill.avg_price, ExitReason::OppositeSignal)),
            at: now,
        };
        self.position = None;
        Some(transition)
    }

    /// Record a new position from a confirmed entry fill.
    pub fn confirm_open(&mut self, side: PositionSide, fill: &OrderFill) -> &Position {
        let entry = fill.avg_price;
        let level = |pct: f64| match side {
            PositionSide::Long => entry * (1.0 + pct),
            PositionSide::Short => entry * (1.0 - pct),
        };
        let now = Utc::now();
        let position = Position {
            id: Uuid::new_v4(),
            key: self.key.clone(),
            side,
            entry_price: entry,
            original_quantity: fill.filled_qty,
            remaining_quantity: fill.filled_qty,
            rules: self.rules.clone(),
            stop_loss_price: level(-self.rules.stop_loss_pct),
            take_profit_1_price: level(self.rules.take_profit_1_pct),
            take_profit_2_price: level(self.rules.take_profit_2_pct),
            trailing_armed: false,
            high_water_mark: entry,
            state: PositionState::Open,
            version: 1,
            partial_closes: Vec::new(),
            exit_price: None,
            exit_reason: None,
            created_at: now,
            last_transition_at: now,
        };
        self.position = Some(position);
        self.position.as_ref().expect("position just set")
    }

    /// Evaluate exit obligations against a new price observation.
    ///
    /// High-water-mark moves and the PARTIAL_TP_DONE -> TRAILING step happen
    /// here; actual quantity changes only happen in [`Self::apply_exit`] once
    /// the order filled. Re-invoking after a failed order re-evaluates the
    /// same obligation.
    pub fn observe_price(&mut self, price: f64) -> PriceUpdate {
        let mut update = PriceUpdate::default();
        let Some(position) = self.position.as_mut() else {
            return update;
        };

        match position.state {
            PositionState::Open => {
                if position.stop_breached(price) {
                    update.exit = Some(ExitIntent {
                        intent: OrderIntent::StopLoss,
                        quantity: position.remaining_quantity,
                    });
                } else if position.tp1_reached(price) {
                    update.exit = Some(ExitIntent {
                        intent: OrderIntent::TakeProfit1,
                        quantity: position.remaining_quantity * position.rules.take_profit_1_fraction,
                    });
                }
            }
            PositionState::PartialTpDone | PositionState::Trailing => {
                if position.state == PositionState::PartialTpDone {
                    // First observation after TP1: the remainder is now
                    // managed by the trailing stop.
                    let expected_version = position.version;
                    position.state = PositionState::Trailing;
                    position.version += 1;
                    position.last_transition_at = Utc::now();
                    update.transition = Some(PositionTransition {
                        transition_id: Uuid::new_v4(),
                        position_id: position.id,
                        expected_version,
                        new_state: PositionState::Trailing,
                        remaining_quantity: position.remaining_quantity,
                        high_water_mark: position.high_water_mark,
                        trailing_armed: position.trailing_armed,
                        partial_close: None,
                        exit: None,
                        at: position.last_transition_at,
                    });
                }
                if position.is_new_extreme(price) {
                    position.high_water_mark = price;
                    if let Some(t) = update.transition.as_mut() {
                        t.high_water_mark = price;
                    }
                }
                if position.tp2_reached(price) {
                    update.exit = Some(ExitIntent {
                        intent: OrderIntent::TakeProfit2,
                        quantity: position.remaining_quantity,
                    });
                } else if position.retraced_past_callback(price) {
                    update.exit = Some(ExitIntent {
                        intent: OrderIntent::TrailingStop,
                        quantity: position.remaining_quantity,
                    });
                } else if position.stop_breached(price) {
                    // Original protective stop still backs the remainder.
                    update.exit = Some(ExitIntent {
                        intent: OrderIntent::StopLoss,
                        quantity: position.remaining_quantity,
                    });
                }
            }
            PositionState::Opening | PositionState::Closed => {}
        }
        update
    }

    /// Apply a confirmed exit fill. Returns the transition record plus the
    /// closed snapshot when the position reached its terminal state.
    pub fn apply_exit(
        &mut self,
        intent: &ExitIntent,
        fill: &OrderFill,
    ) -> Option<(PositionTransition, Option<Position>)> {
        let position = self.position.as_mut()?;
        let expected_version = position.version;
        let now = Utc::now();

        let transition = match intent.intent {
            OrderIntent::TakeProfit1 => {
                let closed_qty = fill.filled_qty.min(position.remaining_quantity);
                let record = PartialClose {
                    quantity: closed_qty,
                    price: fill.avg_price,
                    at: now,
                };
                position.remaining_quantity -= closed_qty;
                position.partial_closes.push(record.clone());
                position.state = PositionState::PartialTpDone;
                position.high_water_mark = fill.avg_price;
                position.trailing_armed = true;
                position.version += 1;
                position.last_transition_at = now;
                PositionTransition {
                    transition_id: Uuid::new_v4(),
                    position_id: position.id,
                    expected_version,
                    new_state: position.state,
                    remaining_quantity: position.remaining_quantity,
                    high_water_mark: position.high_water_mark,
                    trailing_armed: true,
                    partial_close: Some(record),
                    exit: None,
                    at: now,
                }
            }
            OrderIntent::StopLoss | OrderIntent::TrailingStop | OrderIntent::TakeProfit2 => {
                let reason = match intent.intent {
                    OrderIntent::StopLoss => ExitReason::StopLoss,
                    OrderIntent::TrailingStop => ExitReason::TrailingStop,
                    _ => ExitReason::TakeProfit2,
                };
                position.state = PositionState::Closed;
                position.remaining_quantity = 0.0;
                position.exit_price = Some(fill.avg_price);
                position.exit_reason = Some(reason);
                position.version += 1;
                position.last_transition_at = now;
                PositionTransition {
                    transition_id: Uuid::new_v4(),
                    position_id: position.id,
                    expected_version,
                    new_state: PositionState::Closed,
                    remaining_quantity: 0.0,
                    high_water_mark: position.high_water_mark,
                    trailing_armed: position.trailing_armed,
                    partial_close: None,
                    exit: Some((fill.avg_price, reason)),
                    at: now,
                }
            }
            OrderIntent::Entry | OrderIntent::CloseOpposite => return None,
        };

        let closed = if transition.new_state == PositionState::Closed {
            self.position.take()
        } else {
            None
        };
        Some((transition, closed))
    }
}
