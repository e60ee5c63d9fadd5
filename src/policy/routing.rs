//! Routing policies for adaptive, stage-based model selection.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::budget::MatchSpec;

/// Conditions under which a stage switches to its fallback model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DowngradeTrigger {
    /// Downgrade once any matching budget has crossed a soft threshold.
    pub soft_threshold_exceeded: bool,
    /// Downgrade when the tightest remaining budget drops strictly below
    /// this amount. `remaining == threshold` does not trigger.
    pub remaining_budget_below: Option<Decimal>,
}

/// Why a model call was downgraded to its fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeReason {
    SoftThresholdExceeded,
    RemainingBudgetBelow {
        remaining: Decimal,
        threshold: Decimal,
    },
}

impl std::fmt::Display for DowngradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DowngradeReason::SoftThresholdExceeded => {
                f.write_str("soft budget threshold exceeded")
            }
            DowngradeReason::RemainingBudgetBelow {
                remaining,
                threshold,
            } => write!(
                f,
                "remaining budget ({remaining}) below threshold ({threshold})"
            ),
        }
    }
}

impl DowngradeTrigger {
    pub fn should_downgrade(
        &self,
        soft_threshold_exceeded: bool,
        remaining_budget: Option<Decimal>,
    ) -> Option<DowngradeReason> {
        if self.soft_threshold_exceeded && soft_threshold_exceeded {
            return Some(DowngradeReason::SoftThresholdExceeded);
        }
        if let (Some(threshold), Some(remaining)) = (self.remaining_budget_below, remaining_budget)
            && remaining < threshold
        {
            return Some(DowngradeReason::RemainingBudgetBelow {
                remaining,
                threshold,
            });
        }
        None
    }
}

/// Model configuration for one semantic stage ("planning", "synthesis", ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: String,
    pub default_model: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub trigger_downgrade_on: DowngradeTrigger,
}

impl StageConfig {
    /// Effective model under the current budget conditions.
    ///
    /// A trigger without a configured fallback model never downgrades.
    pub fn effective_model(
        &self,
        soft_threshold_exceeded: bool,
        remaining_budget: Option<Decimal>,
    ) -> (&str, Option<DowngradeReason>) {
        if let Some(fallback) = &self.fallback_model
            && let Some(reason) = self
                .trigger_downgrade_on
                .should_downgrade(soft_threshold_exceeded, remaining_budget)
        {
            return (fallback, Some(reason));
        }
        (&self.default_model, None)
    }
}

/// Complete routing policy: match criteria plus an ordered stage list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub id: String,
    #[serde(default, rename = "match")]
    pub match_spec: MatchSpec,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// Used when a call's stage has no entry in `stages`.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub default_fallback_model: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RoutingPolicy {
    pub fn matches(&self, tenant_id: &str, strand_id: &str, workflow_id: &str) -> bool {
        self.enabled && self.match_spec.matches(tenant_id, strand_id, workflow_id)
    }

    pub fn specificity(&self) -> u8 {
        self.match_spec.specificity()
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stage_with_trigger(trigger: DowngradeTrigger) -> StageConfig {
        StageConfig {
            stage: "planning".into(),
            default_model: "gpt-4o".into(),
            fallback_model: Some("gpt-4o-mini".into()),
            max_tokens: Some(4096),
            trigger_downgrade_on: trigger,
        }
    }

    #[test]
    fn test_downgrade_on_soft_threshold() {
        let stage = stage_with_trigger(DowngradeTrigger {
            soft_threshold_exceeded: true,
            remaining_budget_below: None,
        });

        let (model, reason) = stage.effective_model(false, None);
        assert_eq!(model, "gpt-4o");
        assert!(reason.is_none());

        let (model, reason) = stage.effective_model(true, None);
        assert_eq!(model, "gpt-4o-mini");
        assert_eq!(reason, Some(DowngradeReason::SoftThresholdExceeded));
    }

    #[test]
    fn test_remaining_budget_boundary_is_strictly_less() {
        let stage = stage_with_trigger(DowngradeTrigger {
            soft_threshold_exceeded: false,
            remaining_budget_below: Some(dec!(5.0)),
        });

        // remaining == threshold: no downgrade
        let (model, reason) = stage.effective_model(false, Some(dec!(5.00)));
        assert_eq!(model, "gpt-4o");
        assert!(reason.is_none());

        // strictly below: downgrade
        let (model, reason) = stage.effective_model(false, Some(dec!(4.99)));
        assert_eq!(model, "gpt-4o-mini");
        assert!(matches!(
            reason,
            Some(DowngradeReason::RemainingBudgetBelow { .. })
        ));
    }

    #[test]
    fn test_no_fallback_means_no_downgrade() {
        let stage = StageConfig {
            fallback_model: None,
            ..stage_with_trigger(DowngradeTrigger {
                soft_threshold_exceeded: true,
                remaining_budget_below: None,
            })
        };
        let (model, reason) = stage.effective_model(true, None);
        assert_eq!(model, "gpt-4o");
        assert!(reason.is_none());
    }

    #[test]
    fn test_routing_policy_from_yaml() {
        let yaml = r#"
id: acme-routing
match:
  tenant_id: acme
stages:
  - stage: planning
    default_model: gpt-4o
    fallback_model: gpt-4o-mini
    max_tokens: 8192
    trigger_downgrade_on:
      soft_threshold_exceeded: true
      remaining_budget_below: 5.0
  - stage: synthesis
    default_model: gpt-4o
default_model: gpt-4o-mini
"#;
        let policy: RoutingPolicy = serde_yaml_bw::from_str(yaml).unwrap();
        assert_eq!(policy.id, "acme-routing");
        assert_eq!(policy.stages.len(), 2);
        assert!(policy.matches("acme", "any", "any"));
        assert!(!policy.matches("globex", "any", "any"));

        let planning = policy.stage("planning").unwrap();
        assert_eq!(
            planning.trigger_downgrade_on.remaining_budget_below,
            Some(dec!(5.0))
        );
        assert!(policy.stage("tool_selection").is_none());
    }
}
