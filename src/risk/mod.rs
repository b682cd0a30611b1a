use crate::models::{MonitorKey, PositionSide, StrategyId};

/// Trade proposed to the risk gate before any new-position order.
#[derive(Debug, Clone)]
pub struct ProposedTrade {
    pub key: MonitorKey,
    pub side: PositionSide,
    pub reference_price: f64,
    pub strategy: StrategyId,
}

/// Admission decision. `allowed = false` is a normal no-op for the engine,
/// never an error and never retried.
#[derive(Debug, Clone)]
pub struct RiskDecision {
    pub allowed: bool,
    pub sized_quantity: f64,
    pub violations: Vec<String>,
}

impl RiskDecision {
    pub fn allow(sized_quantity: f64) -> Self {
        Self {
            allowed: true,
            sized_quantity,
            violations: Vec::new(),
        }
    }

    pub fn block(violations: Vec<String>) -> Self {
        Self {
            allowed: false,
            sized_quantity: 0.0,
            violations,
        }
    }
}

/// Admission control and position sizing, called synchronously before every
/// new-position order.
pub trait RiskGate: Send + Sync {
    fn check_and_size(&self, proposed: &ProposedTrade) -> RiskDecision;
}

/// Default gate: risk a fixed fraction of account equity per position.
#[derive(Debug, Clone)]
pub struct FixedFractionRiskGate {
    pub equity: f64,
    pub max_position_pct: f64,
}

impl FixedFractionRiskGate {
    pub fn new(equity: f64, max_position_pct: f64) -> Self {
        Self {
            equity,
            max_position_pct,
        }
    }
}

impl RiskGate for FixedFractionRiskGate {
    fn check_and_size(&self, proposed: &ProposedTrade) -> RiskDecision {
        if proposed.reference_price <= 0.0 {
            return RiskDecision::block(vec![format!(
                "non-positive reference price {}",
                proposed.reference_price
            )]);
        }
        let max_value = self.equity * self.max_position_pct;
        let quantity = max_value / proposed.reference_price;
        if quantity <= 0.0 {
            return RiskDecision::block(vec!["sized quantity is zero".to_string()]);
        }
        RiskDecision::allow(quantity)
    }
}
