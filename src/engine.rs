//! The guard engine: run registry, hook surface, and background tasks.
//!
//! [`CostGuard`] is the integration point for an agent runtime. Each hook
//! is synchronous and cheap: policy lookups read an atomic snapshot,
//! accounting happens inside ledger shard locks, and everything slow
//! (event delivery, persistence) runs on background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::CostGuardConfig;
use crate::decisions::{
    AdmissionDecision, IterationDecision, ModelDecision, RejectReason, ToolDecision,
};
use crate::events::{EventBus, EventSink, GuardEvent, LoggingSink};
use crate::governor;
use crate::ledger::{CostDelta, CostTarget, CrossingKind, ThresholdCrossing, UsageLedger};
use crate::metrics::{Measurement, MetricValue, MetricsEmitter, TracingEmitter, names};
use crate::persistence::PersistenceAdapter;
use crate::policy::budget::{HardLimitAction, ThresholdAction};
use crate::policy::resolver::{RunIds, resolve};
use crate::policy::store::{PolicySource, PolicyStore, StaticPolicySource};
use crate::router::{self, BudgetConditions};
use crate::run::{RunContext, RunOutcome, RunState, RunStatus, RunSummary};
use crate::{Error, Result};

const HOUSEKEEPING_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Point-in-time usage report for one budget matching a context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetSummary {
    pub budget_id: String,
    pub scope_key: crate::ledger::ScopeKey,
    pub consumed_cost: Decimal,
    pub max_cost: Option<Decimal>,
    pub remaining: Option<Decimal>,
    pub utilization: f64,
    pub run_count: u64,
    pub concurrent_runs: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Budget and routing decision engine for agent runs.
pub struct CostGuard {
    config: CostGuardConfig,
    policies: PolicyStore,
    ledger: Arc<UsageLedger>,
    admission: AdmissionController,
    runs: DashMap<String, RunState, ahash::RandomState>,
    metrics: Arc<dyn MetricsEmitter>,
    events: Arc<EventBus>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    persistence_warned: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CostGuard {
    pub fn builder() -> CostGuardBuilder {
        CostGuardBuilder::default()
    }

    pub fn config(&self) -> &CostGuardConfig {
        &self.config
    }

    /// Re-reads policies from the source; decisions in flight keep the
    /// snapshot they started with.
    pub fn reload_policies(&self) -> Result<()> {
        self.policies.reload()
    }

    /// Admission check for a new run. On admission the run is registered
    /// and its concurrency slots are held until [`CostGuard::on_run_end`].
    pub fn on_run_start(&self, context: RunContext) -> Result<AdmissionDecision> {
        let now = Utc::now();
        let snapshot = self.policies.snapshot();
        let resolved = resolve(
            &snapshot,
            RunIds {
                tenant_id: &context.tenant_id,
                strand_id: &context.strand_id,
                workflow_id: &context.workflow_id,
            },
            &self.config,
        );
        let targets = CostTarget::for_run(
            &resolved.budgets,
            &context.tenant_id,
            &context.strand_id,
            &context.workflow_id,
        );

        let decision = match self.runs.entry(context.run_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::DuplicateRun {
                    run_id: context.run_id,
                });
            }
            Entry::Vacant(slot) => {
                let decision =
                    self.admission
                        .admit(&context.run_id, &resolved, &targets, &self.config, now);
                if decision.allowed {
                    slot.insert(RunState::new(
                        context.clone(),
                        decision.effective_constraints.clone(),
                        targets,
                        now,
                    ));
                }
                decision
            }
        };

        if decision.allowed {
            info!(
                run_id = %context.run_id,
                tenant_id = %context.tenant_id,
                budget = ?decision.matched_budget_id,
                "run admitted"
            );
            self.emit(names::AGENT_RUNS, MetricValue::Count(1), self.attrs(&context));
            self.events.publish(GuardEvent::RunAdmitted {
                run_id: context.run_id,
                tenant_id: context.tenant_id,
                matched_budget_id: decision.matched_budget_id.clone(),
                at: now,
            });
        } else if let Some(reason) = decision.reason {
            info!(
                run_id = %context.run_id,
                tenant_id = %context.tenant_id,
                %reason,
                budget = ?decision.matched_budget_id,
                "run rejected"
            );
            self.emit(
                names::REJECTION_EVENTS,
                MetricValue::Count(1),
                self.attrs(&context),
            );
            self.events.publish(GuardEvent::RunRejected {
                run_id: context.run_id,
                tenant_id: context.tenant_id,
                reason,
                matched_budget_id: decision.matched_budget_id.clone(),
                at: now,
            });
        }
        Ok(decision)
    }

    /// Gate before one agent loop iteration. Read-only; the iteration is
    /// counted by [`CostGuard::after_iteration`].
    pub fn before_iteration(&self, run_id: &str) -> Result<IterationDecision> {
        let now = Utc::now();
        let state = self.runs.get(run_id).ok_or_else(|| Error::UnknownRun {
            run_id: run_id.to_string(),
        })?;

        let decision = if self.config.enable_budget_enforcement {
            governor::before_iteration(&state)
        } else {
            IterationDecision::allow()
        };
        if !decision.allowed {
            return Ok(decision);
        }

        let keys = state.scope_keys();
        drop(state);
        self.ledger.touch(run_id, &keys, now);
        Ok(decision)
    }

    /// Counts a completed iteration.
    pub fn after_iteration(&self, run_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut state = self.runs.get_mut(run_id).ok_or_else(|| Error::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        state.iterations += 1;
        state.last_activity = now;
        let attrs = self.attrs(&state.context);
        drop(state);

        self.emit(names::AGENT_ITERATIONS, MetricValue::Count(1), attrs);
        Ok(())
    }

    /// Gate before one model call: run-level checks, then routing. A
    /// token estimate above the effective cap produces a warning so the
    /// caller can clamp the request.
    pub fn before_model_call(
        &self,
        run_id: &str,
        stage: Option<&str>,
        requested_model: &str,
        prompt_tokens_estimate: Option<u64>,
    ) -> Result<ModelDecision> {
        let now = Utc::now();
        let state = self.runs.get(run_id).ok_or_else(|| Error::UnknownRun {
            run_id: run_id.to_string(),
        })?;

        if self.config.enable_budget_enforcement {
            if !state.is_active() {
                return Ok(ModelDecision::deny(RejectReason::RunHalted, requested_model));
            }
            if let Some(max) = state.effective.max_model_tokens_per_run
                && state.cumulative_tokens() >= max
            {
                return Ok(ModelDecision::deny(RejectReason::TokenLimit, requested_model));
            }
        }

        let conditions = self.budget_conditions(&state.targets, now);
        let token_headroom = state
            .effective
            .max_model_tokens_per_run
            .map(|max| max.saturating_sub(state.cumulative_tokens()));
        let context = state.context.clone();
        drop(state);

        let mut decision = if self.config.enable_routing {
            let snapshot = self.policies.snapshot();
            let resolved = resolve(
                &snapshot,
                RunIds {
                    tenant_id: &context.tenant_id,
                    strand_id: &context.strand_id,
                    workflow_id: &context.workflow_id,
                },
                &self.config,
            );
            router::route(resolved.routing.as_ref(), stage, requested_model, conditions)
        } else {
            ModelDecision::allow(requested_model)
        };

        decision.effective_max_tokens = match (decision.effective_max_tokens, token_headroom) {
            (Some(stage_max), Some(headroom)) => Some(stage_max.min(headroom)),
            (stage_max, headroom) => stage_max.or(headroom),
        };
        if let (Some(estimate), Some(cap)) = (prompt_tokens_estimate, decision.effective_max_tokens)
            && estimate > cap
        {
            decision
                .warnings
                .push(format!("token estimate {estimate} clamped to {cap}"));
        }

        if decision.downgraded {
            self.emit(
                names::DOWNGRADE_EVENTS,
                MetricValue::Count(1),
                self.attrs(&context),
            );
            self.events.publish(GuardEvent::ModelDowngraded {
                run_id: run_id.to_string(),
                stage: stage.map(str::to_string),
                from_model: requested_model.to_string(),
                to_model: decision.effective_model.clone(),
                reason: decision
                    .downgrade_reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                at: now,
            });
        }
        Ok(decision)
    }

    /// Records a completed model call and returns its cost.
    pub fn after_model_call(
        &self,
        run_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<Decimal> {
        let now = Utc::now();
        let pricing = Arc::clone(&self.policies.snapshot().pricing);
        let cost = pricing.model_call_cost(model, input_tokens, output_tokens);

        let mut state = self.runs.get_mut(run_id).ok_or_else(|| Error::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        state.add_model_cost(model, cost, input_tokens, output_tokens);
        state.last_activity = now;
        let targets = state.targets.clone();
        let context = state.context.clone();
        let per_run_exceeded = self.config.enable_budget_enforcement
            && state.is_active()
            && governor::run_cost_exceeded(&state).is_some();
        if per_run_exceeded {
            state.halt("per-run cost limit exceeded");
        }
        drop(state);

        if per_run_exceeded {
            self.publish_halt(run_id, &context, "per-run cost limit exceeded", now);
        }

        let crossings = self.ledger.add_cost(
            &targets,
            CostDelta {
                cost,
                input_tokens,
                output_tokens,
                tool_calls: 0,
            },
            now,
        );
        self.apply_crossings(run_id, &context, &targets, crossings, now);

        let attrs = self.attrs(&context);
        self.emit(names::COST_TOTAL, MetricValue::Cost(cost), attrs.clone());
        let mut model_attrs = attrs.clone();
        model_attrs.push(("costguard.model".into(), model.to_string()));
        self.emit(names::COST_MODEL, MetricValue::Cost(cost), model_attrs);
        self.emit(
            names::TOKENS_INPUT,
            MetricValue::Count(input_tokens),
            attrs.clone(),
        );
        self.emit(names::TOKENS_OUTPUT, MetricValue::Count(output_tokens), attrs);

        self.persist_targets(&targets);
        Ok(cost)
    }

    /// Gate before one tool call.
    pub fn before_tool_call(&self, run_id: &str, _tool: &str) -> Result<ToolDecision> {
        let state = self.runs.get(run_id).ok_or_else(|| Error::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        if !self.config.enable_budget_enforcement {
            return Ok(ToolDecision::allow(None));
        }
        Ok(governor::before_tool_call(&state))
    }

    /// Records a completed tool call and returns its cost.
    pub fn after_tool_call(&self, run_id: &str, tool: &str) -> Result<Decimal> {
        let now = Utc::now();
        let pricing = Arc::clone(&self.policies.snapshot().pricing);
        let cost = pricing.tool_call_cost(tool);

        let mut state = self.runs.get_mut(run_id).ok_or_else(|| Error::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        state.add_tool_cost(tool, cost);
        state.last_activity = now;
        let targets = state.targets.clone();
        let context = state.context.clone();
        drop(state);

        let crossings = self.ledger.add_cost(
            &targets,
            CostDelta {
                cost,
                tool_calls: 1,
                ..Default::default()
            },
            now,
        );
        self.apply_crossings(run_id, &context, &targets, crossings, now);

        let attrs = self.attrs(&context);
        let mut tool_attrs = attrs.clone();
        tool_attrs.push(("costguard.tool".into(), tool.to_string()));
        self.emit(names::COST_TOTAL, MetricValue::Cost(cost), attrs.clone());
        self.emit(names::COST_TOOL, MetricValue::Cost(cost), tool_attrs);
        self.emit(names::AGENT_TOOL_CALLS, MetricValue::Count(1), attrs);

        self.persist_targets(&targets);
        Ok(cost)
    }

    /// Ends a run with the caller-reported outcome, releasing its
    /// concurrency slots whatever that outcome is. Idempotent: ending a
    /// run that is not registered returns `None`.
    ///
    /// An engine-initiated halt takes precedence over the reported
    /// outcome; the returned summary carries the authoritative status.
    pub fn on_run_end(&self, run_id: &str, outcome: RunOutcome) -> Result<Option<RunSummary>> {
        let now = Utc::now();
        let Some((_, mut state)) = self.runs.remove(run_id) else {
            debug!(run_id, "on_run_end for unknown or already ended run");
            return Ok(None);
        };
        if state.status == RunStatus::Active {
            state.status = outcome.status();
        }
        self.ledger.release_concurrent(run_id, &state.scope_keys());

        if let Some(target) = state.targets.first() {
            self.emit(
                names::BUDGET_UTILIZATION,
                MetricValue::Gauge(self.ledger.utilization(target, now)),
                self.attrs(&state.context),
            );
        }
        self.events.publish(GuardEvent::RunCompleted {
            run_id: run_id.to_string(),
            tenant_id: state.context.tenant_id.clone(),
            status: state.status,
            total_cost: state.cost,
            iterations: state.iterations,
            tool_calls: state.tool_calls,
            at: now,
        });
        info!(
            run_id,
            cost = %state.cost,
            iterations = state.iterations,
            tool_calls = state.tool_calls,
            status = ?state.status,
            "run ended"
        );

        self.persist_targets(&state.targets);
        Ok(Some(RunSummary::from_state(&state, now)))
    }

    /// Usage report across every budget matching a context, most specific
    /// first.
    pub fn budget_summary(
        &self,
        tenant_id: &str,
        strand_id: &str,
        workflow_id: &str,
    ) -> Vec<BudgetSummary> {
        let now = Utc::now();
        let snapshot = self.policies.snapshot();
        let resolved = resolve(
            &snapshot,
            RunIds {
                tenant_id,
                strand_id,
                workflow_id,
            },
            &self.config,
        );
        CostTarget::for_run(&resolved.budgets, tenant_id, strand_id, workflow_id)
            .into_iter()
            .map(|target| {
                let view = self.ledger.view(&target, now);
                let remaining = target
                    .spec
                    .max_cost
                    .map(|max| (max - view.consumed_cost).max(Decimal::ZERO));
                BudgetSummary {
                    budget_id: target.spec.id.clone(),
                    consumed_cost: view.consumed_cost,
                    max_cost: target.spec.max_cost,
                    remaining,
                    utilization: self.ledger.utilization(&target, now),
                    run_count: view.run_count,
                    concurrent_runs: view.concurrent_runs,
                    window_start: view.window.start,
                    window_end: view.window.end,
                    scope_key: target.key,
                }
            })
            .collect()
    }

    /// Stops background tasks, drains queued events, and flushes usage to
    /// the persistence adapter.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = match self.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };
        let drain_timeout = StdDuration::from_secs(self.config.shutdown_drain_timeout_secs);
        for handle in handles {
            if timeout(drain_timeout, handle).await.is_err() {
                warn!("background task did not stop within the drain timeout");
            }
        }

        if let Some(adapter) = &self.persistence {
            for (key, record) in self.ledger.export() {
                if let Err(err) = adapter.save(&key, &record, None).await {
                    warn!(%key, error = %err, "failed to flush usage record on shutdown");
                }
            }
        }
        info!(dropped_events = self.events.dropped(), "cost guard stopped");
    }

    fn budget_conditions(&self, targets: &[CostTarget], now: DateTime<Utc>) -> BudgetConditions {
        let mut conditions = BudgetConditions::default();
        for target in targets {
            let view = self.ledger.view(target, now);
            if view.threshold_state.soft_crossed() {
                conditions.soft_threshold_exceeded = true;
            }
            if let Some(max) = target.spec.max_cost {
                let remaining = (max - view.consumed_cost).max(Decimal::ZERO);
                conditions.remaining_budget = Some(match conditions.remaining_budget {
                    Some(current) => current.min(remaining),
                    None => remaining,
                });
            }
        }
        conditions
    }

    fn apply_crossings(
        &self,
        run_id: &str,
        context: &RunContext,
        targets: &[CostTarget],
        crossings: Vec<ThresholdCrossing>,
        now: DateTime<Utc>,
    ) {
        for crossing in crossings {
            let consumed = targets
                .iter()
                .find(|t| t.key == crossing.key)
                .map(|t| self.ledger.view(t, now).consumed_cost)
                .unwrap_or_default();

            match crossing.kind {
                CrossingKind::Soft {
                    threshold, action, ..
                } => {
                    info!(
                        key = %crossing.key,
                        budget = %crossing.budget_id,
                        %threshold,
                        %consumed,
                        ?action,
                        "soft budget threshold crossed"
                    );
                    self.events.publish(GuardEvent::ThresholdCrossed {
                        scope_key: crossing.key.clone(),
                        budget_id: crossing.budget_id.clone(),
                        threshold,
                        consumed,
                        at: now,
                    });
                    match action {
                        ThresholdAction::LimitCapabilities => {
                            if let Some(mut state) = self.runs.get_mut(run_id) {
                                state.limit_capabilities();
                            }
                        }
                        // The router and the admission controller read the
                        // recorded threshold state on their next decision.
                        ThresholdAction::LogOnly
                        | ThresholdAction::DowngradeModel
                        | ThresholdAction::HaltNewRuns => {}
                    }
                }
                CrossingKind::Hard { action } => {
                    warn!(
                        key = %crossing.key,
                        budget = %crossing.budget_id,
                        %consumed,
                        ?action,
                        "hard budget limit reached"
                    );
                    self.events.publish(GuardEvent::HardLimitReached {
                        scope_key: crossing.key.clone(),
                        budget_id: crossing.budget_id.clone(),
                        consumed,
                        at: now,
                    });
                    match action {
                        HardLimitAction::HaltRun => {
                            let reason = format!(
                                "hard limit of budget {} exceeded",
                                crossing.budget_id
                            );
                            if let Some(mut state) = self.runs.get_mut(run_id)
                                && state.is_active()
                            {
                                state.halt(reason.clone());
                                drop(state);
                                self.publish_halt(run_id, context, &reason, now);
                            }
                        }
                        // Admission rejects on the recorded hard stop.
                        HardLimitAction::RejectNewRuns => {}
                    }
                }
            }
        }
    }

    fn publish_halt(&self, run_id: &str, context: &RunContext, reason: &str, now: DateTime<Utc>) {
        warn!(run_id, reason, "run halted");
        self.emit(names::HALT_EVENTS, MetricValue::Count(1), self.attrs(context));
        self.events.publish(GuardEvent::RunHalted {
            run_id: run_id.to_string(),
            tenant_id: context.tenant_id.clone(),
            reason: reason.to_string(),
            at: now,
        });
    }

    fn attrs(&self, context: &RunContext) -> Vec<(String, String)> {
        let mut attrs = context.attributes();
        if self.config.include_run_id_in_metrics {
            attrs.push(("costguard.run_id".into(), context.run_id.clone()));
        }
        attrs
    }

    fn emit(&self, name: &'static str, value: MetricValue, attributes: Vec<(String, String)>) {
        if !self.config.enable_metrics {
            return;
        }
        if let Err(err) = self.metrics.emit(Measurement {
            name,
            value,
            attributes,
        }) {
            debug!(metric = name, error = %err, "metrics emission failed");
        }
    }

    /// Best-effort background save of the targets' records. Failures are
    /// logged once and never affect decisions.
    fn persist_targets(&self, targets: &[CostTarget]) {
        let Some(adapter) = self.persistence.as_ref().map(Arc::clone) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if !self.persistence_warned.swap(true, Ordering::Relaxed) {
                warn!("no async runtime on this thread, usage persistence skipped");
            }
            return;
        };
        let records: Vec<_> = targets
            .iter()
            .filter_map(|t| self.ledger.snapshot(&t.key).map(|r| (t.key.clone(), r)))
            .collect();
        let warned = Arc::clone(&self.persistence_warned);
        handle.spawn(async move {
            for (key, record) in records {
                if let Err(err) = adapter.save(&key, &record, None).await {
                    if !warned.swap(true, Ordering::Relaxed) {
                        warn!(%key, error = %err, "persistence unavailable, continuing in-memory");
                    }
                    break;
                }
            }
        });
    }
}

impl std::fmt::Debug for CostGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostGuard")
            .field("config", &self.config)
            .field("active_runs", &self.runs.len())
            .finish()
    }
}

/// Builder for [`CostGuard`].
pub struct CostGuardBuilder {
    config: CostGuardConfig,
    source: Box<dyn PolicySource>,
    metrics: Arc<dyn MetricsEmitter>,
    sink: Arc<dyn EventSink>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
}

impl Default for CostGuardBuilder {
    fn default() -> Self {
        Self {
            config: CostGuardConfig::default(),
            source: Box::new(StaticPolicySource::new()),
            metrics: Arc::new(TracingEmitter),
            sink: Arc::new(LoggingSink),
            persistence: None,
        }
    }
}

impl CostGuardBuilder {
    pub fn config(mut self, config: CostGuardConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy_source(mut self, source: impl PolicySource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsEmitter>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    /// Loads policies, seeds the ledger from persistence if configured,
    /// and starts the background tasks.
    pub async fn build(self) -> Result<CostGuard> {
        let policies = PolicyStore::new(self.source)?;
        let ledger = Arc::new(UsageLedger::new());

        if let Some(adapter) = &self.persistence {
            match adapter.load().await {
                Ok(records) => ledger.seed(records),
                Err(err) => {
                    warn!(error = %err, "could not load persisted usage, starting empty");
                }
            }
        }

        let events = Arc::new(EventBus::new(self.config.event_queue_capacity));
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        {
            let events = Arc::clone(&events);
            let sink = Arc::clone(&self.sink);
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        event = events.next() => sink.deliver(event),
                    }
                }
                for event in events.drain_now() {
                    sink.deliver(event);
                }
            }));
        }

        {
            let ledger = Arc::clone(&ledger);
            let token = shutdown.clone();
            let idle = self.config.reservation_idle_timeout_secs;
            let grace = self.config.record_retention_grace_secs;
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            let now = Utc::now();
                            if let Some(idle_secs) = idle {
                                ledger.release_expired_leases(
                                    Duration::seconds(idle_secs as i64),
                                    now,
                                );
                            }
                            ledger.gc_expired(Duration::seconds(grace as i64), now);
                        }
                    }
                }
            }));
        }

        Ok(CostGuard {
            admission: AdmissionController::new(Arc::clone(&ledger)),
            config: self.config,
            policies,
            ledger,
            runs: DashMap::default(),
            metrics: self.metrics,
            events,
            persistence: self.persistence,
            persistence_warned: Arc::new(AtomicBool::new(false)),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::budget::{BudgetSpec, Scope};

    async fn guard() -> CostGuard {
        CostGuard::builder()
            .policy_source(
                StaticPolicySource::new().with_budget(BudgetSpec::new("global", Scope::Global)),
            )
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_run_start_is_an_error() {
        let guard = guard().await;
        let context = RunContext::new("acme", "support-bot", "triage").with_run_id("run-1");

        assert!(guard.on_run_start(context.clone()).unwrap().allowed);
        let err = guard.on_run_start(context).unwrap_err();
        assert!(matches!(err, Error::DuplicateRun { .. }));
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_run_is_an_error() {
        let guard = guard().await;
        let err = guard.before_iteration("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownRun { .. }));
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_end_is_idempotent() {
        let guard = guard().await;
        let context = RunContext::new("acme", "support-bot", "triage").with_run_id("run-1");
        guard.on_run_start(context).unwrap();

        let summary = guard.on_run_end("run-1", RunOutcome::Completed).unwrap();
        assert!(summary.is_some());
        assert!(
            guard
                .on_run_end("run-1", RunOutcome::Completed)
                .unwrap()
                .is_none()
        );
        guard.shutdown().await;
    }
}
