//! Admission control for new runs.
//!
//! Checks run in a fixed sequence over the matching budgets, most
//! specific first: hard limit, then rate limit, then concurrency. The
//! first failure wins and names the budget that produced it. Rate and
//! concurrency counts are taken check-and-increment, atomically across
//! all matching scopes, so a rejected run never leaves a partial
//! reservation behind and racing admits never overshoot a cap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::CostGuardConfig;
use crate::decisions::{AdmissionDecision, RejectReason};
use crate::ledger::{AdmitBlock, CostTarget, UsageLedger};
use crate::policy::budget::{HardLimitAction, ThresholdAction};
use crate::policy::resolver::ResolvedPolicies;

pub struct AdmissionController {
    ledger: Arc<UsageLedger>,
}

impl AdmissionController {
    pub fn new(ledger: Arc<UsageLedger>) -> Self {
        Self { ledger }
    }

    /// Decides whether a run may start and, if so, reserves its
    /// concurrency slots and counts it against each matching budget.
    pub fn admit(
        &self,
        run_id: &str,
        resolved: &ResolvedPolicies,
        targets: &[CostTarget],
        config: &CostGuardConfig,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        if !config.enable_budget_enforcement {
            self.ledger.admit_unchecked(run_id, targets, now);
            return self.admitted(resolved, targets, now);
        }

        for target in targets {
            let view = self.ledger.view(target, now);

            // (a) Hard limit: the period's budget is spent.
            let hard_blocked = view.threshold_state.hard_stopped
                && target.spec.on_hard_limit_exceeded == HardLimitAction::RejectNewRuns;
            // A crossed HALT_NEW_RUNS soft threshold blocks admission the
            // same way, reported under the same reason.
            let soft_blocked = view.threshold_state.soft_crossed()
                && target.spec.on_soft_threshold_exceeded == ThresholdAction::HaltNewRuns;
            if hard_blocked || soft_blocked {
                debug!(budget = %target.spec.id, run_id, "admission rejected: hard limit");
                return self.rejected(RejectReason::HardLimit, target, resolved, targets, now);
            }
        }

        // (b) Rate limit, then (c) concurrency: both checked and counted
        // inside each key's critical section, all or nothing across every
        // matching scope, so racing admits can never overshoot a cap.
        if let Err((idx, block)) = self.ledger.try_admit(run_id, targets, now) {
            let target = &targets[idx];
            let reason = match block {
                AdmitBlock::RateLimit => RejectReason::RateLimit,
                AdmitBlock::ConcurrencyLimit => RejectReason::ConcurrencyLimit,
            };
            debug!(budget = %target.spec.id, run_id, %reason, "admission rejected");
            return self.rejected(reason, target, resolved, targets, now);
        }

        self.admitted(resolved, targets, now)
    }

    fn admitted(
        &self,
        resolved: &ResolvedPolicies,
        targets: &[CostTarget],
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let mut decision = AdmissionDecision::admit(resolved.constraints.clone());
        decision.matched_budget_id = resolved.governing_budget().map(|b| b.id.clone());
        decision.remaining_budget = self.tightest_remaining(targets, now);
        decision.budget_utilization = targets
            .first()
            .map(|t| self.ledger.utilization(t, now));

        for target in targets {
            let view = self.ledger.view(target, now);
            if let Some(index) = view.threshold_state.crossed
                && let Some(threshold) = target.spec.soft_thresholds.get(index)
            {
                decision.warnings.push(format!(
                    "budget {} is over {threshold} utilization",
                    target.spec.id
                ));
            }
        }
        decision
    }

    fn rejected(
        &self,
        reason: RejectReason,
        target: &CostTarget,
        resolved: &ResolvedPolicies,
        targets: &[CostTarget],
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let mut decision = AdmissionDecision::reject(reason, target.spec.id.clone());
        decision.effective_constraints = resolved.constraints.clone();
        decision.remaining_budget = self.tightest_remaining(targets, now);
        decision.budget_utilization = Some(self.ledger.utilization(target, now));
        decision
    }

    /// Smallest remaining headroom across the cost-capped targets.
    fn tightest_remaining(&self, targets: &[CostTarget], now: DateTime<Utc>) -> Option<Decimal> {
        targets
            .iter()
            .filter_map(|target| {
                let consumed = self.ledger.view(target, now).consumed_cost;
                target
                    .spec
                    .max_cost
                    .map(|max| (max - consumed).max(Decimal::ZERO))
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CostDelta, ScopeKey};
    use crate::policy::budget::{BudgetSpec, MatchSpec, Scope};
    use crate::policy::resolver::{RunIds, resolve};
    use crate::policy::store::{PolicyStore, StaticPolicySource};
    use rust_decimal_macros::dec;

    const IDS: RunIds<'static> = RunIds {
        tenant_id: "acme",
        strand_id: "support-bot",
        workflow_id: "triage",
    };

    struct Fixture {
        ledger: Arc<UsageLedger>,
        controller: AdmissionController,
        resolved: ResolvedPolicies,
        targets: Vec<CostTarget>,
        config: CostGuardConfig,
    }

    fn fixture(budgets: Vec<BudgetSpec>) -> Fixture {
        let mut source = StaticPolicySource::new();
        for budget in budgets {
            source = source.with_budget(budget);
        }
        let store = PolicyStore::new(Box::new(source)).unwrap();
        let config = CostGuardConfig::default();
        let resolved = resolve(&store.snapshot(), IDS, &config);
        let targets = CostTarget::for_run(
            &resolved.budgets,
            IDS.tenant_id,
            IDS.strand_id,
            IDS.workflow_id,
        );
        let ledger = Arc::new(UsageLedger::new());
        Fixture {
            controller: AdmissionController::new(Arc::clone(&ledger)),
            ledger,
            resolved,
            targets,
            config,
        }
    }

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
    fn test_admit_reserves_and_counts() {
        let f = fixture(vec![BudgetSpec {
            max_concurrent_runs: Some(2),
            ..tenant_budget("b")
        }]);
        let now = Utc::now();

        let decision = f
            .controller
            .admit("run-1", &f.resolved, &f.targets, &f.config, now);
        assert!(decision.allowed);
        assert_eq!(decision.matched_budget_id.as_deref(), Some("b"));

        let view = f.ledger.view(&f.targets[0], now);
        assert_eq!(view.concurrent_runs, 1);
        assert_eq!(view.run_count, 1);
    }

    #[test]
    fn test_hard_stopped_budget_rejects_new_runs() {
        let f = fixture(vec![BudgetSpec {
            max_cost: Some(dec!(10)),
            ..tenant_budget("b")
        }]);
        let now = Utc::now();
        f.ledger.add_cost(
            &f.targets,
            CostDelta {
                cost: dec!(10),
                ..Default::default()
            },
            now,
        );

        let decision = f
            .controller
            .admit("run-1", &f.resolved, &f.targets, &f.config, now);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::HardLimit));
        assert_eq!(decision.remaining_budget, Some(dec!(0)));
        // No partial state: the rejected run holds no slot and is not
        // counted as started.
        let view = f.ledger.view(&f.targets[0], now);
        assert_eq!(view.concurrent_runs, 0);
        assert_eq!(view.run_count, 0);
    }

    #[test]
    fn test_rate_limit_counts_admissions_per_period() {
        let f = fixture(vec![BudgetSpec {
            max_runs_per_period: Some(2),
            ..tenant_budget("b")
        }]);
        let now = Utc::now();

        for run_id in ["run-1", "run-2"] {
            let d = f
                .controller
                .admit(run_id, &f.resolved, &f.targets, &f.config, now);
            assert!(d.allowed);
        }
        let d = f
            .controller
            .admit("run-3", &f.resolved, &f.targets, &f.config, now);
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(RejectReason::RateLimit));
    }

    #[test]
    fn test_concurrency_frees_slot_on_release() {
        let f = fixture(vec![BudgetSpec {
            max_concurrent_runs: Some(1),
            ..tenant_budget("b")
        }]);
        let now = Utc::now();
        let keys: Vec<ScopeKey> = f.targets.iter().map(|t| t.key.clone()).collect();

        assert!(
            f.controller
                .admit("run-1", &f.resolved, &f.targets, &f.config, now)
                .allowed
        );
        let d = f
            .controller
            .admit("run-2", &f.resolved, &f.targets, &f.config, now);
        assert_eq!(d.reason, Some(RejectReason::ConcurrencyLimit));

        f.ledger.release_concurrent("run-1", &keys);
        assert!(
            f.controller
                .admit("run-3", &f.resolved, &f.targets, &f.config, now)
                .allowed
        );
    }

    #[test]
    fn test_enforcement_disabled_admits_but_records() {
        let f = fixture(vec![BudgetSpec {
            max_runs_per_period: Some(0),
            max_concurrent_runs: Some(0),
            ..tenant_budget("b")
        }]);
        let config = CostGuardConfig {
            enable_budget_enforcement: false,
            ..CostGuardConfig::default()
        };
        let now = Utc::now();

        let d = f
            .controller
            .admit("run-1", &f.resolved, &f.targets, &config, now);
        assert!(d.allowed);
        let view = f.ledger.view(&f.targets[0], now);
        assert_eq!(view.run_count, 1);
        assert_eq!(view.concurrent_runs, 1);
    }

    #[test]
    fn test_soft_halt_new_runs_blocks_admission() {
        let f = fixture(vec![BudgetSpec {
            max_cost: Some(dec!(100)),
            soft_thresholds: vec![dec!(0.7)],
            on_soft_threshold_exceeded: ThresholdAction::HaltNewRuns,
            ..tenant_budget("b")
        }]);
        let now = Utc::now();
        f.ledger.add_cost(
            &f.targets,
            CostDelta {
                cost: dec!(75),
                ..Default::default()
            },
            now,
        );

        let d = f
            .controller
            .admit("run-1", &f.resolved, &f.targets, &f.config, now);
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(RejectReason::HardLimit));
    }
}
