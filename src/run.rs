//! Per-run identity and mutable accounting state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{CostTarget, ScopeKey};
use crate::policy::EffectiveConstraints;

/// Identity of one agent run. Immutable for the run's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub tenant_id: String,
    pub strand_id: String,
    pub workflow_id: String,
    pub run_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(
        tenant_id: impl Into<String>,
        strand_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            strand_id: strand_id.into(),
            workflow_id: workflow_id.into(),
            run_id: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attributes identifying this run on metrics and events.
    pub fn attributes(&self) -> Vec<(String, String)> {
        vec![
            ("costguard.tenant_id".into(), self.tenant_id.clone()),
            ("costguard.strand_id".into(), self.strand_id.clone()),
            ("costguard.workflow_id".into(), self.workflow_id.clone()),
        ]
    }
}

/// Lifecycle of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
    Halted,
}

/// Terminal status reported by the caller when a run ends.
///
/// A halt is not an outcome: only the engine halts runs, and a halted run
/// stays `Halted` whatever outcome the caller reports afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn status(self) -> RunStatus {
        match self {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed => RunStatus::Failed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Mutable accounting state of an admitted run.
///
/// Owned by the engine's run registry; all mutation happens inside the
/// registry's per-run critical section.
#[derive(Debug, Clone)]
pub struct RunState {
    pub context: RunContext,
    pub status: RunStatus,
    pub iterations: u32,
    pub tool_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
    /// Cost attributed per model name.
    pub model_costs: HashMap<String, Decimal>,
    /// Cost attributed per tool name.
    pub tool_costs: HashMap<String, Decimal>,
    /// Limits in force for this run; tightened in place when a matched
    /// budget's soft action is LIMIT_CAPABILITIES.
    pub effective: EffectiveConstraints,
    /// Budget targets this run reserved against; cost recorded during the
    /// run is attributed to these, and release uses their keys, so a
    /// policy reload mid-run cannot orphan a reservation.
    pub targets: Vec<CostTarget>,
    pub halted_reason: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl RunState {
    pub fn new(
        context: RunContext,
        effective: EffectiveConstraints,
        targets: Vec<CostTarget>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            context,
            status: RunStatus::Active,
            iterations: 0,
            tool_calls: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: Decimal::ZERO,
            model_costs: HashMap::new(),
            tool_costs: HashMap::new(),
            effective,
            targets,
            halted_reason: None,
            last_activity: now,
        }
    }

    pub fn scope_keys(&self) -> Vec<ScopeKey> {
        self.targets.iter().map(|t| t.key.clone()).collect()
    }

    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }

    pub fn add_model_cost(
        &mut self,
        model: &str,
        cost: Decimal,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.cost += cost;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        *self.model_costs.entry(model.to_string()).or_default() += cost;
    }

    pub fn add_tool_cost(&mut self, tool: &str, cost: Decimal) {
        self.cost += cost;
        self.tool_calls += 1;
        *self.tool_costs.entry(tool.to_string()).or_default() += cost;
    }

    pub fn cumulative_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Permanently halts the run; subsequent decisions for it are denied.
    pub fn halt(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Halted;
        self.halted_reason = Some(reason.into());
    }

    /// Tightens the run's limits to half the remaining headroom, so a run
    /// under budget pressure winds down instead of stopping cold.
    pub fn limit_capabilities(&mut self) {
        if let Some(max) = self.effective.max_iterations_per_run {
            let remaining = max.saturating_sub(self.iterations);
            self.effective.max_iterations_per_run = Some(self.iterations + remaining / 2);
        }
        if let Some(max) = self.effective.max_tool_calls_per_run {
            let remaining = max.saturating_sub(self.tool_calls);
            self.effective.max_tool_calls_per_run = Some(self.tool_calls + remaining / 2);
        }
        if let Some(max) = self.effective.max_model_tokens_per_run {
            let remaining = max.saturating_sub(self.cumulative_tokens());
            self.effective.max_model_tokens_per_run =
                Some(self.cumulative_tokens() + remaining / 2);
        }
    }
}

/// Final accounting for a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub tenant_id: String,
    pub strand_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub total_cost: Decimal,
    pub iterations: u32,
    pub tool_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model_costs: HashMap<String, Decimal>,
    pub tool_costs: HashMap<String, Decimal>,
    pub halted_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_state(state: &RunState, ended_at: DateTime<Utc>) -> Self {
        Self {
            run_id: state.context.run_id.clone(),
            tenant_id: state.context.tenant_id.clone(),
            strand_id: state.context.strand_id.clone(),
            workflow_id: state.context.workflow_id.clone(),
            status: state.status,
            total_cost: state.cost,
            iterations: state.iterations,
            tool_calls: state.tool_calls,
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            model_costs: state.model_costs.clone(),
            tool_costs: state.tool_costs.clone(),
            halted_reason: state.halted_reason.clone(),
            started_at: state.context.started_at,
            ended_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn state() -> RunState {
        RunState::new(
            RunContext::new("acme", "support-bot", "triage"),
            EffectiveConstraints {
                max_iterations_per_run: Some(20),
                max_tool_calls_per_run: Some(40),
                max_model_tokens_per_run: Some(100_000),
                max_cost_per_run: None,
            },
            vec![],
            Utc::now(),
        )
    }

    #[test]
    fn test_run_context_generates_run_id() {
        let a = RunContext::new("acme", "s", "w");
        let b = RunContext::new("acme", "s", "w");
        assert_ne!(a.run_id, b.run_id);

        let c = RunContext::new("acme", "s", "w").with_run_id("run-42");
        assert_eq!(c.run_id, "run-42");
    }

    #[test]
    fn test_cost_attribution_per_model_and_tool() {
        let mut state = state();
        state.add_model_cost("gpt-4o", dec!(0.50), 500, 200);
        state.add_model_cost("gpt-4o", dec!(0.25), 100, 50);
        state.add_tool_cost("web_search", dec!(0.01));

        assert_eq!(state.cost, dec!(0.76));
        assert_eq!(state.model_costs["gpt-4o"], dec!(0.75));
        assert_eq!(state.tool_costs["web_search"], dec!(0.01));
        assert_eq!(state.cumulative_tokens(), 850);
        assert_eq!(state.tool_calls, 1);
    }

    #[test]
    fn test_limit_capabilities_halves_remaining_headroom() {
        let mut state = state();
        state.iterations = 10;
        state.tool_calls = 10;

        state.limit_capabilities();
        // 10 done + (20 - 10) / 2 = 15
        assert_eq!(state.effective.max_iterations_per_run, Some(15));
        // 10 done + (40 - 10) / 2 = 25
        assert_eq!(state.effective.max_tool_calls_per_run, Some(25));
        assert_eq!(state.effective.max_model_tokens_per_run, Some(50_000));
    }

    #[test]
    fn test_halt_is_permanent() {
        let mut state = state();
        state.halt("hard budget limit exceeded");
        assert_eq!(state.status, RunStatus::Halted);
        assert!(!state.is_active());
        assert_eq!(
            state.halted_reason.as_deref(),
            Some("hard budget limit exceeded")
        );
    }
}
