//! Decision types returned by the guard's hook surface.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::policy::EffectiveConstraints;
use crate::policy::routing::DowngradeReason;

/// Why a decision denied the requested action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    HardLimit,
    RateLimit,
    ConcurrencyLimit,
    IterationLimit,
    TokenLimit,
    ToolCallLimit,
    RunHalted,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::HardLimit => "hard_limit",
            RejectReason::RateLimit => "rate_limit",
            RejectReason::ConcurrencyLimit => "concurrency_limit",
            RejectReason::IterationLimit => "iteration_limit",
            RejectReason::TokenLimit => "token_limit",
            RejectReason::ToolCallLimit => "tool_call_limit",
            RejectReason::RunHalted => "run_halted",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the admission check for a new run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    /// Budget that produced the rejection, or the governing budget on
    /// admission.
    pub matched_budget_id: Option<String>,
    pub effective_constraints: EffectiveConstraints,
    /// Remaining headroom on the tightest matching cost budget.
    pub remaining_budget: Option<Decimal>,
    /// Utilization of the governing budget, as a fraction.
    pub budget_utilization: Option<f64>,
    pub warnings: Vec<String>,
}

impl AdmissionDecision {
    pub fn admit(constraints: EffectiveConstraints) -> Self {
        Self {
            allowed: true,
            reason: None,
            matched_budget_id: None,
            effective_constraints: constraints,
            remaining_budget: None,
            budget_utilization: None,
            warnings: Vec::new(),
        }
    }

    pub fn reject(reason: RejectReason, budget_id: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            matched_budget_id: Some(budget_id.into()),
            effective_constraints: EffectiveConstraints::default(),
            remaining_budget: None,
            budget_utilization: None,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of the check before one agent loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    pub effective_max_iterations: Option<u32>,
    pub effective_max_tokens: Option<u64>,
    pub warnings: Vec<String>,
}

impl IterationDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            effective_max_iterations: None,
            effective_max_tokens: None,
            warnings: Vec::new(),
        }
    }

    pub fn deny(reason: RejectReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            effective_max_iterations: None,
            effective_max_tokens: None,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of the check before one model call, including routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    /// Model the call should actually use.
    pub effective_model: String,
    pub downgraded: bool,
    pub downgrade_reason: Option<DowngradeReason>,
    pub effective_max_tokens: Option<u64>,
    pub warnings: Vec<String>,
}

impl ModelDecision {
    pub fn allow(model: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: None,
            effective_model: model.into(),
            downgraded: false,
            downgrade_reason: None,
            effective_max_tokens: None,
            warnings: Vec::new(),
        }
    }

    pub fn deny(reason: RejectReason, requested_model: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            effective_model: requested_model.into(),
            downgraded: false,
            downgrade_reason: None,
            effective_max_tokens: None,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of the check before one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    pub remaining_tool_calls: Option<u32>,
    pub warnings: Vec<String>,
}

impl ToolDecision {
    pub fn allow(remaining: Option<u32>) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_tool_calls: remaining,
            warnings: Vec::new(),
        }
    }

    pub fn deny(reason: RejectReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            remaining_tool_calls: Some(0),
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_wire_format() {
        let json = serde_json::to_string(&RejectReason::ConcurrencyLimit).unwrap();
        assert_eq!(json, r#""concurrency_limit""#);
        assert_eq!(RejectReason::HardLimit.to_string(), "hard_limit");
    }

    #[test]
    fn test_admission_ctors() {
        let ok = AdmissionDecision::admit(EffectiveConstraints::default());
        assert!(ok.allowed);
        assert!(ok.reason.is_none());

        let no = AdmissionDecision::reject(RejectReason::RateLimit, "acme-monthly");
        assert!(!no.allowed);
        assert_eq!(no.reason, Some(RejectReason::RateLimit));
        assert_eq!(no.matched_budget_id.as_deref(), Some("acme-monthly"));
    }
}
