//! Budget specifications: scopes, periods, match criteria, and limit actions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Scope level at which a budget applies.
///
/// Ordering is by specificity: a workflow budget overrides a strand budget,
/// which overrides a tenant budget, which overrides the global default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Tenant,
    Strand,
    Workflow,
}

impl Scope {
    /// Base priority for policy merging (higher wins).
    pub fn priority(self) -> u8 {
        match self {
            Scope::Global => 0,
            Scope::Tenant => 10,
            Scope::Strand => 20,
            Scope::Workflow => 30,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Tenant => "tenant",
            Scope::Strand => "strand",
            Scope::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurring window over which usage accumulates before reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hourly,
    Daily,
    Weekly,
    #[default]
    Monthly,
}

/// Field-equality match criteria with `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpec {
    #[serde(default = "wildcard")]
    pub tenant_id: String,
    #[serde(default = "wildcard")]
    pub strand_id: String,
    #[serde(default = "wildcard")]
    pub workflow_id: String,
}

fn wildcard() -> String {
    "*".to_string()
}

impl Default for MatchSpec {
    fn default() -> Self {
        Self {
            tenant_id: wildcard(),
            strand_id: wildcard(),
            workflow_id: wildcard(),
        }
    }
}

impl MatchSpec {
    pub fn matches(&self, tenant_id: &str, strand_id: &str, workflow_id: &str) -> bool {
        fn field_matches(pattern: &str, value: &str) -> bool {
            pattern == "*" || pattern == value
        }
        field_matches(&self.tenant_id, tenant_id)
            && field_matches(&self.strand_id, strand_id)
            && field_matches(&self.workflow_id, workflow_id)
    }

    /// Specificity score within a scope level (exact fields beat wildcards).
    pub fn specificity(&self) -> u8 {
        let mut score = 0;
        if self.tenant_id != "*" {
            score += 1;
        }
        if self.strand_id != "*" {
            score += 2;
        }
        if self.workflow_id != "*" {
            score += 4;
        }
        score
    }
}

/// Action fired when a soft utilization threshold is crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdAction {
    #[default]
    LogOnly,
    DowngradeModel,
    LimitCapabilities,
    HaltNewRuns,
}

/// Action fired when the hard limit (utilization >= 1.0) is crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardLimitAction {
    HaltRun,
    #[default]
    RejectNewRuns,
}

/// Per-run constraints carried by a budget.
///
/// Fields left unset fall back to the next less specific matching budget,
/// then to the engine-level defaults in [`crate::config::CostGuardConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConstraints {
    pub max_iterations_per_run: Option<u32>,
    pub max_tool_calls_per_run: Option<u32>,
    pub max_model_tokens_per_run: Option<u64>,
    pub max_cost_per_run: Option<Decimal>,
}

/// Complete budget specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub id: String,
    pub scope: Scope,
    #[serde(default, rename = "match")]
    pub match_spec: MatchSpec,
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub max_cost: Option<Decimal>,
    /// Ascending fractions of `max_cost`, e.g. `[0.7, 0.9, 1.0]`.
    #[serde(default = "default_soft_thresholds")]
    pub soft_thresholds: Vec<Decimal>,
    #[serde(default = "default_true")]
    pub hard_limit: bool,
    #[serde(default)]
    pub on_soft_threshold_exceeded: ThresholdAction,
    #[serde(default)]
    pub on_hard_limit_exceeded: HardLimitAction,
    #[serde(default)]
    pub max_runs_per_period: Option<u64>,
    #[serde(default)]
    pub max_concurrent_runs: Option<u32>,
    #[serde(default)]
    pub constraints: RunConstraints,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_soft_thresholds() -> Vec<Decimal> {
    use rust_decimal_macros::dec;
    vec![dec!(0.7), dec!(0.9), dec!(1.0)]
}

fn default_true() -> bool {
    true
}

impl BudgetSpec {
    /// Minimal budget for programmatic construction; serde fills the rest
    /// when specs come from policy documents.
    pub fn new(id: impl Into<String>, scope: Scope) -> Self {
        Self {
            id: id.into(),
            scope,
            match_spec: MatchSpec::default(),
            period: Period::default(),
            max_cost: None,
            soft_thresholds: default_soft_thresholds(),
            hard_limit: true,
            on_soft_threshold_exceeded: ThresholdAction::default(),
            on_hard_limit_exceeded: HardLimitAction::default(),
            max_runs_per_period: None,
            max_concurrent_runs: None,
            constraints: RunConstraints::default(),
            enabled: true,
        }
    }

    /// Priority for policy merging: scope level dominates, exact match
    /// fields break ties within a level.
    pub fn priority(&self) -> u8 {
        self.scope.priority() + self.match_spec.specificity()
    }

    pub fn matches(&self, tenant_id: &str, strand_id: &str, workflow_id: &str) -> bool {
        self.enabled && self.match_spec.matches(tenant_id, strand_id, workflow_id)
    }
}
