//! Budget and routing decision engine for multi-tenant agent runs.
//!
//! `costguard` sits between an agent runtime and its model/tool providers
//! and answers four questions at well-defined points of a run's lifecycle:
//! may this run start, may it iterate again, which model should this call
//! use, and may it call this tool. Answers come from declarative budgets
//! scoped global → tenant → strand → workflow, with exact decimal cost
//! accounting per recurring period.
//!
//! ```no_run
//! use costguard::{BudgetSpec, CostGuard, RunContext, RunOutcome, Scope, StaticPolicySource};
//! use rust_decimal_macros::dec;
//!
//! # async fn demo() -> costguard::Result<()> {
//! let guard = CostGuard::builder()
//!     .policy_source(StaticPolicySource::new().with_budget(BudgetSpec {
//!         max_cost: Some(dec!(1000)),
//!         ..BudgetSpec::new("tenant-monthly", Scope::Tenant)
//!     }))
//!     .build()
//!     .await?;
//!
//! let run = RunContext::new("acme", "support-bot", "triage");
//! let run_id = run.run_id.clone();
//! let admission = guard.on_run_start(run)?;
//! if admission.allowed {
//!     let decision = guard.before_model_call(&run_id, Some("planning"), "gpt-4o", None)?;
//!     let cost = guard.after_model_call(&run_id, &decision.effective_model, 500, 200)?;
//!     println!("call cost: {cost}");
//!     guard.on_run_end(&run_id, RunOutcome::Completed)?;
//! }
//! guard.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod decisions;
pub mod engine;
pub mod events;
pub mod governor;
pub mod ledger;
pub mod metrics;
pub mod persistence;
pub mod policy;
pub mod pricing;
pub mod router;
pub mod run;

pub use config::CostGuardConfig;
pub use decisions::{
    AdmissionDecision, IterationDecision, ModelDecision, RejectReason, ToolDecision,
};
pub use engine::{BudgetSummary, CostGuard, CostGuardBuilder};
pub use events::{EventSink, GuardEvent};
pub use ledger::{ScopeKey, UsageLedger, UsageRecord};
pub use metrics::MetricsEmitter;
pub use persistence::{MemoryPersistence, PersistenceAdapter, SaveOutcome};
pub use policy::{
    BudgetSpec, HardLimitAction, MatchSpec, Period, PolicySource, RoutingPolicy, RunConstraints,
    Scope, StaticPolicySource, ThresholdAction,
};
pub use pricing::{ModelPricing, PricingTable, ToolPricing};
pub use run::{RunContext, RunOutcome, RunStatus, RunSummary};

use thiserror::Error;

/// Errors surfaced by the guard. Decision outcomes (rejections, halts)
/// are not errors; they come back inside the decision types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load policies: {message}")]
    PolicyLoad { message: String },

    /// The run id is not registered: never admitted, or already ended.
    #[error("unknown run: {run_id}")]
    UnknownRun { run_id: String },

    #[error("run already started: {run_id}")]
    DuplicateRun { run_id: String },

    #[error("persistence unavailable: {message}")]
    PersistenceUnavailable { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
