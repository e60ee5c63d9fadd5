//! Concurrency-safe usage accounting per scope and period.
//!
//! The ledger is the single source of truth for "how much has been spent".
//! Records are keyed by [`ScopeKey`] and mutated inside dashmap shard locks,
//! so unrelated scopes proceed independently and all mutations on one key
//! are serialized. No I/O happens while a shard lock is held; threshold
//! crossings are returned to the caller, which fires the actions.

pub mod period;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::policy::budget::{BudgetSpec, HardLimitAction, Scope, ThresholdAction};

use period::PeriodWindow;

/// Identity of one usage-aggregation scope.
///
/// The key stays stable across period rollovers; the record it points to
/// carries the current window and is reset in place when the window
/// expires. Keeping the key stable means concurrency reservations made in
/// one window survive into the next, so long-lived runs are still counted
/// against `max_concurrent_runs` and can always be released.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope: Scope,
    pub path: String,
}

impl ScopeKey {
    /// Key for a budget applied to a concrete (tenant, strand, workflow).
    ///
    /// Wider scopes embed fewer identifiers, so e.g. every workflow of a
    /// tenant shares that tenant's key.
    pub fn for_budget(
        spec: &BudgetSpec,
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
    ) -> Self {
        let path = match spec.scope {
            Scope::Global => spec.id.clone(),
            Scope::Tenant => format!("{tenant_id}:{}", spec.id),
            Scope::Strand => format!("{tenant_id}:{strand_id}:{}", spec.id),
            Scope::Workflow => format!("{tenant_id}:{strand_id}:{workflow_id}:{}", spec.id),
        };
        Self {
            scope: spec.scope,
            path,
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.path)
    }
}

/// Forward-only threshold progression for one scope and period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdState {
    /// Index of the highest soft threshold already crossed.
    pub crossed: Option<usize>,
    pub hard_stopped: bool,
}

impl ThresholdState {
    pub fn soft_crossed(&self) -> bool {
        self.crossed.is_some()
    }
}

/// Accumulated usage for one scope within its current period window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub window: PeriodWindow,
    pub consumed_cost: Decimal,
    pub run_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub threshold_state: ThresholdState,
    /// Active run ids with their last-activity instant (lease).
    pub active_runs: HashMap<String, DateTime<Utc>>,
    /// Bumped on every mutation; used for optimistic persistence.
    pub version: u64,
}

impl UsageRecord {
    fn new(window: PeriodWindow) -> Self {
        Self {
            window,
            consumed_cost: Decimal::ZERO,
            run_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            tool_calls: 0,
            threshold_state: ThresholdState::default(),
            active_runs: HashMap::new(),
            version: 0,
        }
    }

    /// Resets period counters for a new window. Active runs carry over:
    /// they started in the previous window and still hold their slots.
    fn roll_over(&mut self, window: PeriodWindow) {
        self.window = window;
        self.consumed_cost = Decimal::ZERO;
        self.run_count = 0;
        self.input_tokens = 0;
        self.output_tokens = 0;
        self.tool_calls = 0;
        self.threshold_state = ThresholdState::default();
        self.version += 1;
    }

    pub fn concurrent_run_count(&self) -> u32 {
        self.active_runs.len() as u32
    }

    /// consumed / max as a fraction; 0.0 when the budget is uncapped.
    pub fn utilization(&self, max_cost: Option<Decimal>) -> f64 {
        match max_cost {
            Some(max) if max > Decimal::ZERO => {
                (self.consumed_cost / max).to_f64().unwrap_or(0.0)
            }
            _ => 0.0,
        }
    }

    pub fn remaining(&self, max_cost: Option<Decimal>) -> Option<Decimal> {
        max_cost.map(|max| (max - self.consumed_cost).max(Decimal::ZERO))
    }
}

/// A budget applied to one concrete scope key; the unit the ledger
/// operates on for a given run.
#[derive(Debug, Clone)]
pub struct CostTarget {
    pub key: ScopeKey,
    pub spec: Arc<BudgetSpec>,
}

impl CostTarget {
    /// Targets for all budgets matching a run, in resolution order
    /// (most specific first).
    pub fn for_run(
        budgets: &[Arc<BudgetSpec>],
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
    ) -> Vec<Self> {
        budgets
            .iter()
            .map(|spec| Self {
                key: ScopeKey::for_budget(spec, tenant_id, strand_id, workflow_id),
                spec: Arc::clone(spec),
            })
            .collect()
    }
}

/// A soft-threshold or hard-limit crossing detected by `add_cost`.
///
/// The ledger only reports crossings; firing the configured action is the
/// caller's job, keeping the critical section free of side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCrossing {
    pub key: ScopeKey,
    pub budget_id: String,
    pub kind: CrossingKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrossingKind {
    Soft {
        index: usize,
        threshold: Decimal,
        action: ThresholdAction,
    },
    Hard {
        action: HardLimitAction,
    },
}

/// The cap a target hit during an admission pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitBlock {
    RateLimit,
    ConcurrencyLimit,
}

/// Usage increments attributed by one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostDelta {
    pub cost: Decimal,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
}

/// Read-only snapshot of a record for decision making.
#[derive(Debug, Clone)]
pub struct UsageView {
    pub consumed_cost: Decimal,
    pub run_count: u64,
    pub concurrent_runs: u32,
    pub threshold_state: ThresholdState,
    pub window: PeriodWindow,
}

/// Concurrency-safe accumulator of cost and counters per scope key.
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: DashMap<ScopeKey, UsageRecord, ahash::RandomState>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds records loaded from a persistence adapter at startup.
    pub fn seed(&self, records: HashMap<ScopeKey, UsageRecord>) {
        let count = records.len();
        for (key, record) in records {
            self.records.insert(key, record);
        }
        if count > 0 {
            info!(records = count, "seeded usage ledger from persistence");
        }
    }

    /// Runs `f` on the record for `key` inside its shard lock, creating
    /// the record lazily and rolling it over if its window has expired.
    fn with_record<R>(
        &self,
        target: &CostTarget,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut UsageRecord) -> R,
    ) -> R {
        let mut entry = self
            .records
            .entry(target.key.clone())
            .or_insert_with(|| UsageRecord::new(PeriodWindow::current(target.spec.period, now)));
        let record = entry.value_mut();
        if now >= record.window.end {
            debug!(key = %target.key, "budget period expired, resetting record");
            record.roll_over(PeriodWindow::current(target.spec.period, now));
        }
        f(record)
    }

    /// Current-period view of a target's record.
    pub fn view(&self, target: &CostTarget, now: DateTime<Utc>) -> UsageView {
        self.with_record(target, now, |record| UsageView {
            consumed_cost: record.consumed_cost,
            run_count: record.run_count,
            concurrent_runs: record.concurrent_run_count(),
            threshold_state: record.threshold_state,
            window: record.window,
        })
    }

    /// Current utilization fraction for a target.
    pub fn utilization(&self, target: &CostTarget, now: DateTime<Utc>) -> f64 {
        self.with_record(target, now, |record| {
            record.utilization(target.spec.max_cost)
        })
    }

    /// Admits a run against every target, all or nothing.
    ///
    /// Each target's rate-limit and concurrency checks run as
    /// check-and-increment inside the key's critical section, so
    /// concurrent admits can never push a scope past `max_runs_per_period`
    /// or `max_concurrent_runs`. If any target blocks, the slots and run
    /// counts already taken for this call are rolled back and the failing
    /// target's index is returned with the cap it hit.
    pub fn try_admit(
        &self,
        run_id: &str,
        targets: &[CostTarget],
        now: DateTime<Utc>,
    ) -> Result<(), (usize, AdmitBlock)> {
        for (idx, target) in targets.iter().enumerate() {
            let blocked = self.with_record(target, now, |record| {
                if let Some(max) = target.spec.max_runs_per_period
                    && record.run_count >= max
                {
                    return Some(AdmitBlock::RateLimit);
                }
                if let Some(max) = target.spec.max_concurrent_runs
                    && record.concurrent_run_count() >= max
                {
                    return Some(AdmitBlock::ConcurrencyLimit);
                }
                record.active_runs.insert(run_id.to_string(), now);
                record.run_count += 1;
                record.version += 1;
                None
            });
            if let Some(block) = blocked {
                for prior in &targets[..idx] {
                    self.unadmit_one(run_id, &prior.key);
                }
                return Err((idx, block));
            }
        }
        Ok(())
    }

    /// Admits without checking caps, for accounting-only mode.
    pub fn admit_unchecked(&self, run_id: &str, targets: &[CostTarget], now: DateTime<Utc>) {
        for target in targets {
            self.with_record(target, now, |record| {
                record.active_runs.insert(run_id.to_string(), now);
                record.run_count += 1;
                record.version += 1;
            });
        }
    }

    /// Undoes a tentative admission on one key during rollback. Unlike
    /// release, this also takes back the run count.
    fn unadmit_one(&self, run_id: &str, key: &ScopeKey) {
        if let Some(mut record) = self.records.get_mut(key)
            && record.active_runs.remove(run_id).is_some()
        {
            record.run_count = record.run_count.saturating_sub(1);
            record.version += 1;
        }
    }

    fn release_one(&self, run_id: &str, key: &ScopeKey) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) => {
                let removed = record.active_runs.remove(run_id).is_some();
                if removed {
                    record.version += 1;
                }
                removed
            }
            None => false,
        }
    }

    /// Releases the concurrency slots a run holds. Releasing a run that
    /// holds no slot is a no-op, which makes run teardown idempotent.
    pub fn release_concurrent(&self, run_id: &str, keys: &[ScopeKey]) -> usize {
        keys.iter()
            .filter(|key| self.release_one(run_id, key))
            .count()
    }

    /// Refreshes the lease on a run's reservations.
    pub fn touch(&self, run_id: &str, keys: &[ScopeKey], now: DateTime<Utc>) {
        for key in keys {
            if let Some(mut record) = self.records.get_mut(key)
                && let Some(lease) = record.active_runs.get_mut(run_id)
            {
                *lease = now;
            }
        }
    }

    /// Adds cost and usage to every target and advances threshold state.
    ///
    /// Returns the crossings that occurred, each at most once per period:
    /// the state only moves forward, and a threshold already recorded as
    /// crossed is never reported again.
    pub fn add_cost(
        &self,
        targets: &[CostTarget],
        delta: CostDelta,
        now: DateTime<Utc>,
    ) -> Vec<ThresholdCrossing> {
        let mut crossings = Vec::new();
        for target in targets {
            self.with_record(target, now, |record| {
                record.consumed_cost += delta.cost;
                record.input_tokens += delta.input_tokens;
                record.output_tokens += delta.output_tokens;
                record.tool_calls += delta.tool_calls;
                record.version += 1;

                let Some(max) = target.spec.max_cost else {
                    return;
                };
                if max <= Decimal::ZERO {
                    return;
                }

                let first_unchecked = record
                    .threshold_state
                    .crossed
                    .map(|i| i + 1)
                    .unwrap_or(0);
                for (index, threshold) in target
                    .spec
                    .soft_thresholds
                    .iter()
                    .enumerate()
                    .skip(first_unchecked)
                {
                    if record.consumed_cost >= *threshold * max {
                        record.threshold_state.crossed = Some(index);
                        crossings.push(ThresholdCrossing {
                            key: target.key.clone(),
                            budget_id: target.spec.id.clone(),
                            kind: CrossingKind::Soft {
                                index,
                                threshold: *threshold,
                                action: target.spec.on_soft_threshold_exceeded,
                            },
                        });
                    } else {
                        break;
                    }
                }

                if target.spec.hard_limit
                    && !record.threshold_state.hard_stopped
                    && record.consumed_cost >= max
                {
                    record.threshold_state.hard_stopped = true;
                    crossings.push(ThresholdCrossing {
                        key: target.key.clone(),
                        budget_id: target.spec.id.clone(),
                        kind: CrossingKind::Hard {
                            action: target.spec.on_hard_limit_exceeded,
                        },
                    });
                }
            });
        }
        crossings
    }

    /// Raw record snapshot, e.g. for persistence.
    pub fn snapshot(&self, key: &ScopeKey) -> Option<UsageRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Snapshot of every record, for a shutdown flush.
    pub fn export(&self) -> Vec<(ScopeKey, UsageRecord)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Backstop against leaked slots: releases reservations whose lease
    /// has been idle longer than `idle_for`.
    pub fn release_expired_leases(&self, idle_for: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - idle_for;
        let mut released = 0;
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            let before = record.active_runs.len();
            record.active_runs.retain(|_, lease| *lease >= cutoff);
            let expired = before - record.active_runs.len();
            if expired > 0 {
                record.version += 1;
                released += expired;
            }
        }
        if released > 0 {
            info!(released, "released expired concurrency leases");
        }
        released
    }

    /// Drops records whose window expired more than `grace` ago and that
    /// hold no active reservations.
    pub fn gc_expired(&self, grace: Duration, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.window.end + grace > now || !record.active_runs.is_empty());
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::budget::Period;
    use rust_decimal_macros::dec;

    fn target(spec: BudgetSpec) -> CostTarget {
        let spec = Arc::new(spec);
        CostTarget {
            key: ScopeKey::for_budget(&spec, "acme", "bot", "triage"),
            spec,
        }
    }

    fn cost(amount: Decimal) -> CostDelta {
        CostDelta {
            cost: amount,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_cost_is_exact_sum() {
        let ledger = UsageLedger::new();
        let t = target(BudgetSpec::new("b", Scope::Tenant));
        let now = Utc::now();

        for _ in 0..1000 {
            ledger.add_cost(std::slice::from_ref(&t), cost(dec!(0.195)), now);
        }
        assert_eq!(ledger.view(&t, now).consumed_cost, dec!(195));
    }

    #[test]
    fn test_threshold_crossings_fire_once() {
        let ledger = UsageLedger::new();
        let t = target(BudgetSpec {
            max_cost: Some(dec!(100)),
            ..BudgetSpec::new("b", Scope::Tenant)
        });
        let now = Utc::now();

        // 0 -> 75: crosses 0.7 only.
        let crossings = ledger.add_cost(std::slice::from_ref(&t), cost(dec!(75)), now);
        assert_eq!(crossings.len(), 1);
        assert!(matches!(
            crossings[0].kind,
            CrossingKind::Soft { index: 0, .. }
        ));

        // 75 -> 76: nothing new.
        let crossings = ledger.add_cost(std::slice::from_ref(&t), cost(dec!(1)), now);
        assert!(crossings.is_empty());

        // 76 -> 100: crosses 0.9, 1.0 and the hard limit in one step.
        let crossings = ledger.add_cost(std::slice::from_ref(&t), cost(dec!(24)), now);
        assert_eq!(crossings.len(), 3);
        assert!(matches!(
            crossings[0].kind,
            CrossingKind::Soft { index: 1, .. }
        ));
        assert!(matches!(
            crossings[1].kind,
            CrossingKind::Soft { index: 2, .. }
        ));
        assert!(matches!(crossings[2].kind, CrossingKind::Hard { .. }));

        let view = ledger.view(&t, now);
        assert_eq!(view.threshold_state.crossed, Some(2));
        assert!(view.threshold_state.hard_stopped);
    }

    #[test]
    fn test_reserve_respects_cap_and_rolls_back() {
        let ledger = UsageLedger::new();
        let wide = target(BudgetSpec {
            max_concurrent_runs: Some(10),
            ..BudgetSpec::new("wide", Scope::Tenant)
        });
        let narrow = target(BudgetSpec {
            max_concurrent_runs: Some(1),
            ..BudgetSpec::new("narrow", Scope::Workflow)
        });
        let now = Utc::now();
        let targets = vec![narrow.clone(), wide.clone()];

        ledger.try_admit("run-1", &targets, now).unwrap();
        // Second run hits the narrow cap; the wide reservation must not leak.
        let failed = ledger
            .try_admit("run-2", &targets, now)
            .unwrap_err();
        assert_eq!(failed, (0, AdmitBlock::ConcurrencyLimit));
        assert_eq!(ledger.view(&wide, now).concurrent_runs, 1);
        assert_eq!(ledger.view(&narrow, now).concurrent_runs, 1);
    }

    #[test]
    fn test_admit_checks_rate_limit_in_the_critical_section() {
        let ledger = UsageLedger::new();
        let capped = target(BudgetSpec {
            max_runs_per_period: Some(1),
            ..BudgetSpec::new("capped", Scope::Workflow)
        });
        let open = target(BudgetSpec::new("open", Scope::Tenant));
        let now = Utc::now();
        let targets = vec![open.clone(), capped.clone()];

        ledger.try_admit("run-1", &targets, now).unwrap();
        let failed = ledger.try_admit("run-2", &targets, now).unwrap_err();
        assert_eq!(failed, (1, AdmitBlock::RateLimit));

        // The rollback takes back run-2's tentative count and slot on the
        // open target; only run-1 remains counted anywhere.
        let view = ledger.view(&open, now);
        assert_eq!(view.run_count, 1);
        assert_eq!(view.concurrent_runs, 1);
        let view = ledger.view(&capped, now);
        assert_eq!(view.run_count, 1);
        assert_eq!(view.concurrent_runs, 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let ledger = UsageLedger::new();
        let t = target(BudgetSpec {
            max_concurrent_runs: Some(5),
            ..BudgetSpec::new("b", Scope::Tenant)
        });
        let now = Utc::now();
        let targets = vec![t.clone()];
        let keys = vec![t.key.clone()];

        ledger.try_admit("run-1", &targets, now).unwrap();
        assert_eq!(ledger.release_concurrent("run-1", &keys), 1);
        assert_eq!(ledger.release_concurrent("run-1", &keys), 0);
        assert_eq!(ledger.view(&t, now).concurrent_runs, 0);
    }

    #[test]
    fn test_rollover_resets_counters_keeps_active_runs() {
        let ledger = UsageLedger::new();
        let t = target(BudgetSpec {
            period: Period::Hourly,
            max_cost: Some(dec!(10)),
            ..BudgetSpec::new("b", Scope::Tenant)
        });
        let now = Utc::now();

        ledger
            .try_admit("run-1", std::slice::from_ref(&t), now)
            .unwrap();
        ledger.add_cost(std::slice::from_ref(&t), cost(dec!(10)), now);
        assert!(ledger.view(&t, now).threshold_state.hard_stopped);

        let later = now + Duration::hours(2);
        let view = ledger.view(&t, later);
        assert_eq!(view.consumed_cost, Decimal::ZERO);
        assert_eq!(view.threshold_state, ThresholdState::default());
        // The run admitted last hour still holds its slot.
        assert_eq!(view.concurrent_runs, 1);
    }

    #[test]
    fn test_lease_expiry_releases_slots() {
        let ledger = UsageLedger::new();
        let t = target(BudgetSpec {
            max_concurrent_runs: Some(1),
            ..BudgetSpec::new("b", Scope::Tenant)
        });
        let started = Utc::now();

        ledger
            .try_admit("stuck-run", std::slice::from_ref(&t), started)
            .unwrap();

        let later = started + Duration::minutes(30);
        let released = ledger.release_expired_leases(Duration::minutes(15), later);
        assert_eq!(released, 1);
        ledger
            .try_admit("next-run", std::slice::from_ref(&t), later)
            .unwrap();
    }

    #[test]
    fn test_touch_extends_lease() {
        let ledger = UsageLedger::new();
        let t = target(BudgetSpec::new("b", Scope::Tenant));
        let keys = vec![t.key.clone()];
        let started = Utc::now();

        ledger
            .try_admit("run-1", std::slice::from_ref(&t), started)
            .unwrap();
        let touched = started + Duration::minutes(20);
        ledger.touch("run-1", &keys, touched);

        let released =
            ledger.release_expired_leases(Duration::minutes(15), started + Duration::minutes(30));
        assert_eq!(released, 0);
    }

    #[test]
    fn test_gc_keeps_fresh_and_reserved_records() {
        let ledger = UsageLedger::new();
        let hourly = target(BudgetSpec {
            period: Period::Hourly,
            ..BudgetSpec::new("old", Scope::Tenant)
        });
        let reserved = target(BudgetSpec {
            period: Period::Hourly,
            ..BudgetSpec::new("held", Scope::Strand)
        });
        let now = Utc::now();

        ledger.add_cost(std::slice::from_ref(&hourly), cost(dec!(1)), now);
        ledger
            .try_admit("run-1", std::slice::from_ref(&reserved), now)
            .unwrap();

        let later = now + Duration::hours(3);
        let removed = ledger.gc_expired(Duration::hours(1), later);
        assert_eq!(removed, 1);
        assert!(ledger.snapshot(&hourly.key).is_none());
        assert!(ledger.snapshot(&reserved.key).is_some());
    }
}
