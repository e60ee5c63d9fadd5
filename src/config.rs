//! Engine-level configuration.

use serde::{Deserialize, Serialize};

/// Tuning knobs for the guard engine. Everything here has a sensible
/// default; budgets and routing policies carry the per-scope limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostGuardConfig {
    /// Currency label attached to cost metrics and events.
    pub currency: String,
    /// Master switch for admission and in-run budget enforcement. When
    /// off, every decision is allowed but usage is still recorded.
    pub enable_budget_enforcement: bool,
    /// Master switch for model routing; when off, requested models pass
    /// through unchanged.
    pub enable_routing: bool,
    pub enable_metrics: bool,
    /// Attach the run id to emitted metrics. Off by default: run ids are
    /// high cardinality.
    pub include_run_id_in_metrics: bool,
    /// Fallback iteration cap when no matching budget sets one.
    pub default_max_iterations_per_run: Option<u32>,
    /// Fallback tool-call cap when no matching budget sets one.
    pub default_max_tool_calls_per_run: Option<u32>,
    /// Bounded capacity of the event queue; the oldest event is dropped
    /// on overflow.
    pub event_queue_capacity: usize,
    /// How long shutdown waits for queued events to drain.
    pub shutdown_drain_timeout_secs: u64,
    /// Reservations with no activity for this long are force-released.
    /// `None` disables the backstop.
    pub reservation_idle_timeout_secs: Option<u64>,
    /// How long expired usage records are kept before garbage collection.
    pub record_retention_grace_secs: u64,
}

impl Default for CostGuardConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            enable_budget_enforcement: true,
            enable_routing: true,
            enable_metrics: true,
            include_run_id_in_metrics: false,
            default_max_iterations_per_run: Some(50),
            default_max_tool_calls_per_run: Some(100),
            event_queue_capacity: 1024,
            shutdown_drain_timeout_secs: 5,
            reservation_idle_timeout_secs: Some(3600),
            record_retention_grace_secs: 86_400,
        }
    }
}
