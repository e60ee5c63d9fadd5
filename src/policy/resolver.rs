//! Resolution of the budgets, constraints, and routing policy that govern
//! a concrete run.
//!
//! Snapshots keep their entries sorted by descending priority, so the first
//! match is always the most specific and field merging is a first-non-null
//! scan down the list.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::CostGuardConfig;

use super::budget::{BudgetSpec, HardLimitAction, ThresholdAction};
use super::routing::RoutingPolicy;
use super::store::PolicySnapshot;

/// Identity fields of a run, borrowed from its context.
#[derive(Debug, Clone, Copy)]
pub struct RunIds<'a> {
    pub tenant_id: &'a str,
    pub strand_id: &'a str,
    pub workflow_id: &'a str,
}

/// Per-run limits after merging all matching budgets and engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConstraints {
    pub max_iterations_per_run: Option<u32>,
    pub max_tool_calls_per_run: Option<u32>,
    pub max_model_tokens_per_run: Option<u64>,
    pub max_cost_per_run: Option<Decimal>,
}

/// Everything policy resolution produces for one run.
#[derive(Debug, Clone)]
pub struct ResolvedPolicies {
    /// Matching budgets, most specific first.
    pub budgets: Vec<Arc<BudgetSpec>>,
    /// Most specific matching routing policy, if any.
    pub routing: Option<Arc<RoutingPolicy>>,
    pub constraints: EffectiveConstraints,
    /// Actions from the most specific matching budget.
    pub on_soft: ThresholdAction,
    pub on_hard: HardLimitAction,
}

impl ResolvedPolicies {
    /// The budget whose actions and reporting govern this run.
    pub fn governing_budget(&self) -> Option<&Arc<BudgetSpec>> {
        self.budgets.first()
    }
}

/// Resolves the policies applying to a run from the current snapshot.
///
/// Constraint fields merge independently: each takes its value from the
/// most specific budget that sets it, falling back to the engine defaults
/// for iteration and tool-call caps.
pub fn resolve(
    snapshot: &PolicySnapshot,
    ids: RunIds<'_>,
    config: &CostGuardConfig,
) -> ResolvedPolicies {
    let budgets: Vec<Arc<BudgetSpec>> = snapshot
        .budgets
        .iter()
        .filter(|b| b.matches(ids.tenant_id, ids.strand_id, ids.workflow_id))
        .cloned()
        .collect();

    let routing = snapshot
        .routing_policies
        .iter()
        .find(|p| p.matches(ids.tenant_id, ids.strand_id, ids.workflow_id))
        .cloned();

    let constraints = EffectiveConstraints {
        max_iterations_per_run: budgets
            .iter()
            .find_map(|b| b.constraints.max_iterations_per_run)
            .or(config.default_max_iterations_per_run),
        max_tool_calls_per_run: budgets
            .iter()
            .find_map(|b| b.constraints.max_tool_calls_per_run)
            .or(config.default_max_tool_calls_per_run),
        max_model_tokens_per_run: budgets
            .iter()
            .find_map(|b| b.constraints.max_model_tokens_per_run),
        max_cost_per_run: budgets.iter().find_map(|b| b.constraints.max_cost_per_run),
    };

    let (on_soft, on_hard) = budgets
        .first()
        .map(|b| (b.on_soft_threshold_exceeded, b.on_hard_limit_exceeded))
        .unwrap_or_default();

    ResolvedPolicies {
        budgets,
        routing,
        constraints,
        on_soft,
        on_hard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::budget::{MatchSpec, RunConstraints, Scope};
    use crate::policy::store::{PolicyStore, StaticPolicySource};

    const IDS: RunIds<'static> = RunIds {
        tenant_id: "acme",
        strand_id: "support-bot",
        workflow_id: "triage",
    };

    fn tenant_budget(id: &str) -> BudgetSpec {
        BudgetSpec {
            match_spec: MatchSpec {
                tenant_id: "acme".into(),
                ..Default::default()
            },
            ..BudgetSpec::new(id, Scope::Tenant)
        }
    }

    #[test]
    fn test_constraints_merge_field_by_field() {
        let source = StaticPolicySource::new()
            .with_budget(BudgetSpec {
                constraints: RunConstraints {
                    max_iterations_per_run: Some(50),
                    max_tool_calls_per_run: Some(100),
                    ..Default::default()
                },
                ..BudgetSpec::new("global", Scope::Global)
            })
            .with_budget(BudgetSpec {
                constraints: RunConstraints {
                    max_iterations_per_run: Some(20),
                    ..Default::default()
                },
                ..tenant_budget("acme-monthly")
            });

        let store = PolicyStore::new(Box::new(source)).unwrap();
        let resolved = resolve(&store.snapshot(), IDS, &CostGuardConfig::default());

        // Iterations come from the tenant budget, tool calls fall through
        // to the global one.
        assert_eq!(resolved.constraints.max_iterations_per_run, Some(20));
        assert_eq!(resolved.constraints.max_tool_calls_per_run, Some(100));
        assert_eq!(resolved.constraints.max_model_tokens_per_run, None);
        assert_eq!(resolved.governing_budget().unwrap().id, "acme-monthly");
    }

    #[test]
    fn test_engine_defaults_fill_unset_fields() {
        let store = PolicyStore::new(Box::new(
            StaticPolicySource::new().with_budget(BudgetSpec::new("global", Scope::Global)),
        ))
        .unwrap();
        let config = CostGuardConfig::default();
        let resolved = resolve(&store.snapshot(), IDS, &config);

        assert_eq!(
            resolved.constraints.max_iterations_per_run,
            config.default_max_iterations_per_run
        );
        assert_eq!(
            resolved.constraints.max_tool_calls_per_run,
            config.default_max_tool_calls_per_run
        );
    }

    #[test]
    fn test_equal_specificity_breaks_ties_by_declaration_order() {
        let source = StaticPolicySource::new()
            .with_budget(tenant_budget("first"))
            .with_budget(tenant_budget("second"));

        let store = PolicyStore::new(Box::new(source)).unwrap();
        let resolved = resolve(&store.snapshot(), IDS, &CostGuardConfig::default());
        assert_eq!(resolved.governing_budget().unwrap().id, "first");
    }

    #[test]
    fn test_most_specific_routing_policy_wins() {
        let source = StaticPolicySource::new()
            .with_routing_policy(RoutingPolicy {
                id: "broad".into(),
                match_spec: MatchSpec::default(),
                stages: vec![],
                default_model: Some("gpt-4o-mini".into()),
                default_fallback_model: None,
                enabled: true,
            })
            .with_routing_policy(RoutingPolicy {
                id: "acme".into(),
                match_spec: MatchSpec {
                    tenant_id: "acme".into(),
                    ..Default::default()
                },
                stages: vec![],
                default_model: Some("gpt-4o".into()),
                default_fallback_model: None,
                enabled: true,
            });

        let store = PolicyStore::new(Box::new(source)).unwrap();
        let resolved = resolve(&store.snapshot(), IDS, &CostGuardConfig::default());
        assert_eq!(resolved.routing.unwrap().id, "acme");
    }

    #[test]
    fn test_no_matching_budgets_uses_defaults() {
        let store = PolicyStore::new(Box::new(StaticPolicySource::new())).unwrap();
        let resolved = resolve(&store.snapshot(), IDS, &CostGuardConfig::default());
        assert!(resolved.budgets.is_empty());
        assert_eq!(resolved.on_soft, ThresholdAction::LogOnly);
        assert_eq!(resolved.on_hard, HardLimitAction::RejectNewRuns);
    }
}
