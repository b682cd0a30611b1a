use std::collections::VecDeque;

use crate::models::Candle;

/// Bounded rolling window of closed candles, oldest first.
///
/// Owned by a single monitor task; open times are strictly increasing so a
/// re-fetched candle can never be appended twice.
pub struct CandleWindow {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a candle if it is strictly newer than the last one, evicting
    /// the oldest when full. Returns whether the candle was accepted.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.open_time <= last.open_time {
                return false;
            }
        }
        if self.candles.len() == self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
        true
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn last_open_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.candles.back().map(|c| c.open_time)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Contiguous view for strategy evaluation.
    pub fn as_slice(&mut self) -> &[Candle] {
        self.candles.make_contiguous();
        self.candles.as_slices().0
    }
}
