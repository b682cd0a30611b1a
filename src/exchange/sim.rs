use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::models::{
    Candle, ExchangePosition, OrderFill, OrderRequest, OrderStatus, PositionSide, Timeframe,
    TradeSide,
};

use super::ExchangeAdapter;

/// In-process exchange with a seeded random-walk price process.
///
/// Backs the demo binary and integration tests: candles are generated lazily
/// up to the latest fully closed interval, orders fill at the last close with
/// a small random slippage, and failures can be scripted onto upcoming calls.
pub struct SimulatedExchange {
    state: Mutex<SimState>,
}

struct SimState {
    rng: StdRng,
    base_prices: HashMap<String, f64>,
    series: HashMap<(String, Timeframe), Vec<Candle>>,
    positions: HashMap<String, SimPosition>,
    orders: HashMap<Uuid, OrderFill>,
    scripted_failures: VecDeque<ExchangeError>,
}

struct SimPosition {
    side: PositionSide,
    quantity: f64,
    avg_entry_price: f64,
}

impl SimulatedExchange {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                base_prices: HashMap::new(),
                series: HashMap::new(),
                positions: HashMap::new(),
                orders: HashMap::new(),
                scripted_failures: VecDeque::new(),
            }),
        }
    }

    /// Register a symbol with its starting price.
    pub fn with_symbol(self, symbol: &str, base_price: f64) -> Self {
        self.state
            .lock()
            .unwrap()
            .base_prices
            .insert(symbol.to_string(), base_price);
        self
    }

    /// Script failures onto the next adapter calls, in order.
    pub fn fail_next(&self, errors: Vec<ExchangeError>) {
        self.state
            .lock()
            .unwrap()
            .scripted_failures
            .extend(errors);
    }

    fn take_scripted_failure(state: &mut SimState) -> Option<ExchangeError> {
        state.scripted_failures.pop_front()
    }

    /// Extend the candle series up to the latest fully closed interval.
    fn generate_until(state: &mut SimState, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) {
        let base = match state.base_prices.get(symbol) {
            Some(p) => *p,
            None => return,
        };
        let interval = ChronoDuration::from_std(timeframe.duration()).expect("valid interval");
        let interval_secs = interval.num_seconds();

        // Open time of the most recently closed candle.
        let bucket = now.timestamp().div_euclid(interval_secs) * interval_secs;
        let latest_closed =
            DateTime::from_timestamp(bucket - interval_secs, 0).expect("valid timestamp");

        let series = state
            .series
            .entry((symbol.to_string(), timeframe))
            .or_default();

        let mut open_time = match series.last() {
            Some(last) => last.open_time + interval,
            // Seed with enough history for any reasonable lookback.
            None => latest_closed - interval * 300,
        };
        let mut open = series.last().map(|c| c.close).unwrap_or(base);

        while open_time <= latest_closed {
            let drift: f64 = state.rng.gen_range(-0.004..0.004);
            let close = (open * (1.0 + drift)).max(0.01);
            let wick: f64 = state.rng.gen_range(0.0..0.002);
            let volume: f64 = state.rng.gen_range(500.0..5_000.0);
            series.push(Candle {
                open_time,
                open,
                high: open.max(close) * (1.0 + wick),
                low: open.min(close) * (1.0 - wick),
                close,
                volume,
            });
            open = close;
            open_time += interval;
        }
    }

    fn last_close(state: &SimState, symbol: &str, timeframe: Timeframe) -> Option<f64> {
        state
            .series
            .get(&(symbol.to_string(), timeframe))
            .and_then(|s| s.last())
            .map(|c| c.close)
    }

    fn apply_fill(state: &mut SimState, request: &OrderRequest, price: f64) {
        let symbol = request.key.symbol.clone();
        let signed = match request.side {
            TradeSide::Buy => request.quantity,
            TradeSide::Sell => -request.quantity,
        };
        let existing = state.positions.remove(&symbol);
        let net = match &existing {
            Some(p) => match p.side {
                PositionSide::Long => p.quantity + signed,
                PositionSide::Short => -p.quantity + signed,
            },
            None => signed,
        };
        if net.abs() > 1e-9 {
            state.positions.insert(
                symbol,
                SimPosition {
                    side: if net > 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    quantity: net.abs(),
                    avg_entry_price: price,
                },
            );
        }
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedExchange {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        if !state.base_prices.contains_key(symbol) {
            return Err(ExchangeError::Rejected(format!("unknown symbol {symbol}")));
        }
        Self::generate_until(&mut state, symbol, timeframe, Utc::now());
        let series = state
            .series
            .get(&(symbol.to_string(), timeframe))
            .cloned()
            .unwrap_or_default();
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn place_market_order(
        &self,
        request: &OrderRequest,
    ) -> Result<OrderFill, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        if request.quantity <= 0.0 {
            return Err(ExchangeError::Rejected(format!(
                "invalid quantity {}",
                request.quantity
            )));
        }
        if let Some(fill) = state.orders.get(&request.correlation_id) {
            // Same correlation id resubmitted: idempotent, return the
            // original fill.
            return Ok(fill.clone());
        }

        Self::generate_until(&mut state, &request.key.symbol, request.key.timeframe, Utc::now());
        let last = Self::last_close(&state, &request.key.symbol, request.key.timeframe)
            .ok_or_else(|| {
                ExchangeError::Rejected(format!("unknown symbol {}", request.key.symbol))
            })?;

        let slippage: f64 = state.rng.gen_range(-0.0005..0.0005);
        let avg_price = last * (1.0 + slippage);
        let fill = OrderFill {
            order_id: format!("sim-{}", state.orders.len() + 1),
            avg_price,
            filled_qty: request.quantity,
            status: OrderStatus::Filled,
        };
        state.orders.insert(request.correlation_id, fill.clone());
        Self::apply_fill(&mut state, request, avg_price);
        Ok(fill)
    }

    async fn get_open_positions(
        &self,
        symbol: &str,
    ) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        Ok(state
            .positions
            .get(symbol)
            .map(|p| ExchangePosition {
                symbol: symbol.to_string(),
                side: p.side,
                quantity: p.quantity,
                avg_entry_price: p.avg_entry_price,
            })
            .into_iter()
            .collect())
    }

    async fn find_order(&self, correlation_id: Uuid) -> Result<Option<OrderFill>, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::take_scripted_failure(&mut state) {
            return Err(err);
        }
        Ok(state.orders.get(&correlation_id).cloned())
    }
}
