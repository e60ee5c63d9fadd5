//! Adaptive model routing under budget pressure.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use crate::decisions::ModelDecision;
use crate::policy::routing::{DowngradeReason, RoutingPolicy};

/// Budget conditions the router evaluates a call against.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetConditions {
    /// Any matching budget has crossed a soft threshold this period.
    pub soft_threshold_exceeded: bool,
    /// Headroom on the tightest matching cost budget.
    pub remaining_budget: Option<Decimal>,
}

/// Picks the effective model for one call.
///
/// Resolution order: the stage's entry in the matched routing policy, then
/// the policy's defaults, then the caller's requested model untouched.
/// Downgrades only ever step to the configured fallback; there is no
/// chain.
pub fn route(
    policy: Option<&Arc<RoutingPolicy>>,
    stage: Option<&str>,
    requested_model: &str,
    conditions: BudgetConditions,
) -> ModelDecision {
    let Some(policy) = policy else {
        return ModelDecision::allow(requested_model);
    };

    if let Some(stage_cfg) = stage.and_then(|name| policy.stage(name)) {
        let (model, reason) = stage_cfg.effective_model(
            conditions.soft_threshold_exceeded,
            conditions.remaining_budget,
        );
        let mut decision = ModelDecision::allow(model);
        decision.effective_max_tokens = stage_cfg.max_tokens;
        if let Some(reason) = reason {
            debug!(
                policy = %policy.id,
                stage = %stage_cfg.stage,
                from = %stage_cfg.default_model,
                to = %model,
                %reason,
                "model downgraded"
            );
            decision.downgraded = true;
            decision.downgrade_reason = Some(reason);
        }
        return decision;
    }

    // No stage entry: fall back to the policy-level default pair. The
    // default fallback engages under the same conditions a stage would,
    // with soft-threshold crossing as the trigger.
    let default_model = policy.default_model.as_deref().unwrap_or(requested_model);
    if conditions.soft_threshold_exceeded
        && let Some(fallback) = policy.default_fallback_model.as_deref()
    {
        let mut decision = ModelDecision::allow(fallback);
        decision.downgraded = true;
        decision.downgrade_reason = Some(DowngradeReason::SoftThresholdExceeded);
        return decision;
    }
    ModelDecision::allow(default_model)
}
