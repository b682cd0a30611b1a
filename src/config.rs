//! Engine configuration, loaded from the environment.

use std::env;
use std::time::Duration;

use crate::error::EngineError;
use crate::gateway::{CircuitBreakerConfig, GatewayConfig, RetryPolicy};
use crate::position::ExitRules;
use crate::Result;

/// API credentials for one exchange, read from `{EXCHANGE}_API_KEY` /
/// `{EXCHANGE}_API_SECRET`.
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub account_id: String,
    pub equity: f64,
    pub max_position_pct: f64,
    pub staleness_window_secs: u64,
    pub rules: ExitRules,
    pub gateway: GatewayConfig,
    pub breaker: CircuitBreakerConfig,
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EngineError::config(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Read configuration from the environment, falling back to defaults for
    /// everything but hard errors (present-but-unparseable values).
    pub fn from_env() -> Result<Self> {
        let rules = ExitRules {
            stop_loss_pct: var_or("STOP_LOSS_PCT", 0.05)?,
            take_profit_1_pct: var_or("TAKE_PROFIT_1_PCT", 0.10)?,
            take_profit_1_fraction: var_or("TAKE_PROFIT_1_FRACTION", 0.5)?,
            take_profit_2_pct: var_or("TAKE_PROFIT_2_PCT", 0.15)?,
            trailing_callback_pct: var_or("TRAILING_CALLBACK_PCT", 0.04)?,
        };
        rules.validate()?;

        let retry = RetryPolicy {
            max_attempts: var_or("RETRY_MAX_ATTEMPTS", 3)?,
            initial_delay: Duration::from_millis(var_or("RETRY_INITIAL_DELAY_MS", 500)?),
            ..RetryPolicy::default()
        };
        let gateway = GatewayConfig {
            retry,
            call_timeout: Duration::from_secs(var_or("CALL_TIMEOUT_SECS", 10)?),
            reads_per_second: var_or("READS_PER_SECOND", 10)?,
        };
        let breaker = CircuitBreakerConfig {
            failure_threshold: var_or("BREAKER_FAILURE_THRESHOLD", 5)?,
            recovery_timeout: Duration::from_secs(var_or("BREAKER_RECOVERY_SECS", 60)?),
            success_threshold: var_or("BREAKER_SUCCESS_THRESHOLD", 2)?,
        };

        let config = Self {
            account_id: env::var("ACCOUNT_ID").unwrap_or_else(|_| "default".to_string()),
            equity: var_or("ACCOUNT_EQUITY", 10_000.0)?,
            max_position_pct: var_or("MAX_POSITION_PCT", 0.05)?,
            staleness_window_secs: var_or("SIGNAL_STALENESS_SECS", 300)?,
            rules,
            gateway,
            breaker,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.equity <= 0.0 {
            return Err(EngineError::config("account equity must be positive"));
        }
        if self.max_position_pct <= 0.0 || self.max_position_pct > 1.0 {
            return Err(EngineError::config(
                "max position fraction must be in (0, 1]",
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(EngineError::config("breaker thresholds must be positive"));
        }
        Ok(())
    }

    /// Credentials for `exchange_id`, e.g. `BINANCE_API_KEY` and
    /// `BINANCE_API_SECRET`. Missing credentials fail `start()` for that
    /// exchange's monitors.
    pub fn credentials_for(&self, exchange_id: &str) -> Result<ExchangeCredentials> {
        let prefix = exchange_id.to_uppercase();
        let api_key = env::var(format!("{prefix}_API_KEY"))
            .map_err(|_| EngineError::config(format!("{prefix}_API_KEY not set")))?;
        let api_secret = env::var(format!("{prefix}_API_SECRET"))
            .map_err(|_| EngineError::config(format!("{prefix}_API_SECRET not set")))?;
        Ok(ExchangeCredentials { api_key, api_secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses its own variable names.

    #[test]
    fn test_defaults_when_env_unset() {
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.equity, 10_000.0);
        assert_eq!(config.rules.stop_loss_pct, 0.05);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_unparseable_value_is_an_error() {
        env::set_var("TEST_UNPARSEABLE_KNOB", "not-a-number");
        let result: Result<f64> = var_or("TEST_UNPARSEABLE_KNOB", 1.0);
        env::remove_var("TEST_UNPARSEABLE_KNOB");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_bad_fraction() {
        let mut config = EngineConfig::from_env().unwrap();
        config.max_position_pct = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_credentials_reported() {
        let config = EngineConfig::from_env().unwrap();
        let err = config.credentials_for("nosuchexchange").unwrap_err();
        assert!(err.to_string().contains("NOSUCHEXCHANGE_API_KEY"));
    }
}
