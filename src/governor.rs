//! In-run governors: iteration and tool-call gating against the run's
//! effective constraints.
//!
//! Governors are pure over [`RunState`]; the engine calls them inside the
//! run registry's critical section and applies the side effects (counter
//! bumps, halts) itself.

use rust_decimal::Decimal;

use crate::decisions::{IterationDecision, RejectReason, ToolDecision};
use crate::run::RunState;

/// Fraction of a limit at which decisions start carrying warnings.
const WARN_FRACTION: f64 = 0.8;

fn near_limit(used: u64, max: u64) -> bool {
    max > 0 && used as f64 >= max as f64 * WARN_FRACTION
}

/// Gate for one agent loop iteration.
pub fn before_iteration(state: &RunState) -> IterationDecision {
    if !state.is_active() {
        return IterationDecision::deny(RejectReason::RunHalted);
    }

    let mut decision = IterationDecision::allow();
    decision.effective_max_iterations = state.effective.max_iterations_per_run;
    decision.effective_max_tokens = state.effective.max_model_tokens_per_run;

    if let Some(max) = state.effective.max_iterations_per_run {
        if state.iterations >= max {
            return IterationDecision::deny(RejectReason::IterationLimit);
        }
        if near_limit(u64::from(state.iterations), u64::from(max)) {
            decision
                .warnings
                .push(format!("iteration {} of {max}", state.iterations + 1));
        }
    }

    if let Some(max) = state.effective.max_model_tokens_per_run {
        if state.cumulative_tokens() >= max {
            return IterationDecision::deny(RejectReason::TokenLimit);
        }
        if near_limit(state.cumulative_tokens(), max) {
            decision.warnings.push(format!(
                "{} of {max} model tokens consumed",
                state.cumulative_tokens()
            ));
        }
    }

    if let Some(max_cost) = state.effective.max_cost_per_run
        && state.cost >= max_cost
    {
        return IterationDecision::deny(RejectReason::HardLimit);
    }

    decision
}

/// Gate for one tool call.
pub fn before_tool_call(state: &RunState) -> ToolDecision {
    if !state.is_active() {
        return ToolDecision::deny(RejectReason::RunHalted);
    }

    match state.effective.max_tool_calls_per_run {
        Some(max) if state.tool_calls >= max => ToolDecision::deny(RejectReason::ToolCallLimit),
        Some(max) => {
            let remaining = max - state.tool_calls;
            let mut decision = ToolDecision::allow(Some(remaining));
            if near_limit(u64::from(state.tool_calls), u64::from(max)) {
                decision
                    .warnings
                    .push(format!("{remaining} tool calls remaining"));
            }
            decision
        }
        None => ToolDecision::allow(None),
    }
}

/// Per-run cost cap check, applied after usage is recorded.
pub fn run_cost_exceeded(state: &RunState) -> Option<Decimal> {
    state
        .effective
        .max_cost_per_run
        .filter(|max| state.cost >= *max)
}
