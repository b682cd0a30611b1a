// Order execution gateway: the only component allowed to touch the exchange
// adapter, composing rate limiting, circuit breaking and retry around it.
pub mod breaker;
pub mod retry;

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::error::{EngineError, ExchangeError};
use crate::events::{EngineEvent, EventSink};
use crate::exchange::ExchangeAdapter;
use crate::models::{Candle, ExchangePosition, MonitorKey, OrderFill, OrderRequest};

pub use breaker::{BreakerState, BreakerTransition, CircuitBreaker, CircuitBreakerConfig};
pub use retry::RetryPolicy;

/// Cooperative cancellation flag shared between a monitor task and the
/// gateway. The gateway re-checks it immediately before submitting a
/// mutating order, so `stop(key)` after signal dispatch still suppresses the
/// order.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called. Used by
    /// monitor loops to wake from their poll sleep immediately on `stop`.
    ///
    /// `notify_waiters` only wakes futures already registered with the
    /// `Notify`, so the waiter must be enabled before the flag check or a
    /// `cancel` landing between the two is lost.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub retry: RetryPolicy,
    /// Per-call timeout, independent of the retry budget: one hung call can
    /// never stall the attempt loop.
    pub call_timeout: Duration,
    pub reads_per_second: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(10),
            reads_per_second: 10,
        }
    }
}

pub struct OrderGateway {
    adapter: Arc<dyn ExchangeAdapter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    call_timeout: Duration,
    read_limiter: DefaultDirectRateLimiter,
    events: Arc<dyn EventSink>,
}

impl OrderGateway {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        breaker: Arc<CircuitBreaker>,
        config: GatewayConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let per_second = NonZeroU32::new(config.reads_per_second.max(1)).expect("non-zero");
        Self {
            adapter,
            breaker,
            retry: config.retry,
            call_timeout: config.call_timeout,
            read_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            events,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Read path: rate-limited, breaker-gated, freely retryable.
    pub async fn fetch_candles(
        &self,
        key: &MonitorKey,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        self.read_limiter.until_ready().await;
        self.breaker.try_acquire()?;

        let result = self
            .retry
            .run(
                |_| {
                    Self::with_timeout(
                        self.call_timeout,
                        self.adapter
                            .get_candles(&key.symbol, key.timeframe, limit),
                    )
                },
                |_| true,
            )
            .await;
        self.note_outcome(result.is_ok());
        result.map_err(Into::into)
    }

    /// Read path: authoritative open positions, used for startup
    /// reconciliation.
    pub async fn open_positions(
        &self,
        symbol: &str,
    ) -> Result<Vec<ExchangePosition>, EngineError> {
        self.read_limiter.until_ready().await;
        self.breaker.try_acquire()?;

        let result = self
            .retry
            .run(
                |_| Self::with_timeout(self.call_timeout, self.adapter.get_open_positions(symbol)),
                |_| true,
            )
            .await;
        self.note_outcome(result.is_ok());
        result.map_err(Into::into)
    }

    /// Mutating path. Retries only failures that provably never reached the
    /// exchange; an ambiguous failure triggers a lookup of the order by its
    /// correlation id before any resubmission, so a fill that did land is
    /// adopted instead of duplicated.
    pub async fn execute(
        &self,
        request: &OrderRequest,
        cancel: &CancelFlag,
    ) -> Result<OrderFill, EngineError> {
        self.breaker.try_acquire()?;

        let result = self.execute_attempts(request, cancel).await;
        match &result {
            Ok(fill) => {
                self.note_outcome(true);
                self.events.emit(EngineEvent::OrderSubmitted {
                    key: request.key.clone(),
                    correlation_id: request.correlation_id,
                    side: request.side,
                    quantity: request.quantity,
                    intent: request.intent,
                    avg_price: fill.avg_price,
                });
            }
            Err(EngineError::Cancelled) => {
                // Order suppressed, not an exchange failure.
                tracing::debug!(
                    key = %request.key,
                    correlation_id = %request.correlation_id,
                    "order suppressed by cancellation"
                );
            }
            Err(err) => {
                self.note_outcome(false);
                self.events.emit(EngineEvent::OrderFailed {
                    key: request.key.clone(),
                    correlation_id: request.correlation_id,
                    intent: request.intent,
                    error: err.to_string(),
                });
            }
        }
        result
    }

    async fn execute_attempts(
        &self,
        request: &OrderRequest,
        cancel: &CancelFlag,
    ) -> Result<OrderFill, EngineError> {
        let mut attempt = 1;
        loop {
            // Last cancellation check before the request leaves the process.
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let outcome =
                Self::with_timeout(self.call_timeout, self.adapter.place_market_order(request))
                    .await;
            let err = match outcome {
                Ok(fill) => return Ok(fill),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err.into());
            }

            if !err.safe_to_resend() {
                // The request may have reached the exchange. Consult the
                // authoritative order state before deciding.
                match Self::with_timeout(
                    self.call_timeout,
                    self.adapter.find_order(request.correlation_id),
                )
                .await
                {
                    Ok(Some(fill)) => {
                        tracing::info!(
                            correlation_id = %request.correlation_id,
                            "ambiguous failure resolved: order was executed"
                        );
                        return Ok(fill);
                    }
                    Ok(None) => {
                        // Provably never executed, resubmission is safe.
                    }
                    Err(lookup_err) => {
                        tracing::warn!(
                            correlation_id = %request.correlation_id,
                            error = %lookup_err,
                            "could not resolve ambiguous order failure"
                        );
                        return Err(err.into());
                    }
                }
            }

            if attempt >= self.retry.max_attempts {
                return Err(err.into());
            }
            let delay = self.retry.jittered_delay(attempt);
            tracing::warn!(
                attempt,
                correlation_id = %request.correlation_id,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying order submission"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn with_timeout<T>(
        limit: Duration,
        call: impl std::future::Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            // A timeout gives no evidence either way, treat as ambiguous.
            Err(_) => Err(ExchangeError::ambiguous(format!(
                "call timed out after {limit:?}"
            ))),
        }
    }

    /// One breaker observation per gateway call, regardless of how many
    /// attempts the retry loop burned.
    fn note_outcome(&self, success: bool) {
        let transition = if success {
            self.breaker.record_success()
        } else {
            self.breaker.record_failure()
        };
        match transition {
            Some(BreakerTransition::Opened {
                consecutive_failures,
            }) => {
                self.events.emit(EngineEvent::BreakerOpened {
                    breaker: self.breaker.name().to_string(),
                    consecutive_failures,
                });
            }
            Some(BreakerTransition::Closed) => {
                self.events.emit(EngineEvent::BreakerClosed {
                    breaker: self.breaker.name().to_string(),
                });
            }
            None => {}
        }
    }
}
