use thiserror::Error;

/// Failure raised by an exchange adapter.
///
/// The split between `Transient` and `Rejected` is what the retry manager and
/// circuit breaker key their decisions on, instead of guessing from generic
/// error strings.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network-level failure. `request_sent` records whether the request may
    /// have reached the exchange before the failure: `false` means the call
    /// is safe to blindly retry, `true` means the outcome is ambiguous and
    /// mutating calls must re-check exchange state before resubmitting.
    #[error("transient exchange failure: {message}")]
    Transient { message: String, request_sent: bool },

    /// The exchange answered and refused: bad parameters, insufficient
    /// balance, unknown symbol. Never retried.
    #[error("exchange rejected request: {0}")]
    Rejected(String),
}

impl ExchangeError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            request_sent: false,
        }
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            request_sent: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// True when the request provably never reached the exchange.
    pub fn safe_to_resend(&self) -> bool {
        matches!(
            self,
            Self::Transient {
                request_sent: false,
                ..
            }
        )
    }
}

/// Engine-level error taxonomy.
///
/// `RiskBlocked`, `StaleSignal`, `DataGap` and `BreakerOpen` describe expected
/// conditions that abort a single evaluation cycle; only `Config` is fatal to
/// a monitor, and it is raised synchronously at `start()`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),

    #[error("risk gate blocked trade: {}", violations.join("; "))]
    RiskBlocked { violations: Vec<String> },

    #[error("stale signal from {strategy}: {reason}")]
    StaleSignal { strategy: String, reason: String },

    #[error("candle data gap: {0}")]
    DataGap(String),

    #[error("cancelled before order submission")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("position store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}
