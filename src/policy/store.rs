//! Policy storage with atomic snapshot swap.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::pricing::PricingTable;
use crate::{Error, Result};

use super::budget::BudgetSpec;
use super::routing::RoutingPolicy;

/// Source of policy documents. Implemented outside the core for files,
/// environment, or remote configuration; hot reload swaps the snapshot
/// atomically via [`PolicyStore::reload`].
pub trait PolicySource: Send + Sync {
    fn budgets(&self) -> Result<Vec<BudgetSpec>>;
    fn routing_policies(&self) -> Result<Vec<RoutingPolicy>>;
    fn pricing(&self) -> Result<PricingTable>;
}

/// In-process policy source for programmatic configuration and tests.
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    budgets: Vec<BudgetSpec>,
    routing_policies: Vec<RoutingPolicy>,
    pricing: PricingTable,
}

impl StaticPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, budget: BudgetSpec) -> Self {
        self.budgets.push(budget);
        self
    }

    pub fn with_routing_policy(mut self, policy: RoutingPolicy) -> Self {
        self.routing_policies.push(policy);
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }
}

impl PolicySource for StaticPolicySource {
    fn budgets(&self) -> Result<Vec<BudgetSpec>> {
        Ok(self.budgets.clone())
    }

    fn routing_policies(&self) -> Result<Vec<RoutingPolicy>> {
        Ok(self.routing_policies.clone())
    }

    fn pricing(&self) -> Result<PricingTable> {
        Ok(self.pricing.clone())
    }
}

/// Immutable view of all loaded policies.
///
/// Budgets and routing policies are pre-sorted by descending priority. The
/// sort is stable, so two entries of equal specificity keep their
/// declaration order from the source; the resolver relies on this for
/// deterministic tie-breaking.
#[derive(Debug)]
pub struct PolicySnapshot {
    pub budgets: Vec<Arc<BudgetSpec>>,
    pub routing_policies: Vec<Arc<RoutingPolicy>>,
    pub pricing: Arc<PricingTable>,
    pub loaded_at: DateTime<Utc>,
}

impl PolicySnapshot {
    fn build(
        mut budgets: Vec<BudgetSpec>,
        mut routing_policies: Vec<RoutingPolicy>,
        pricing: PricingTable,
    ) -> Self {
        // Threshold crossing detection walks the list in order and stops
        // at the first uncrossed entry, so a misordered document would
        // silently skip thresholds.
        for budget in &mut budgets {
            if !budget.soft_thresholds.is_sorted() {
                warn!(
                    budget = %budget.id,
                    "soft thresholds listed out of order, sorting ascending"
                );
                budget.soft_thresholds.sort();
            }
        }
        budgets.sort_by(|a, b| b.priority().cmp(&a.priority()));
        routing_policies.sort_by(|a, b| b.specificity().cmp(&a.specificity()));
        Self {
            budgets: budgets.into_iter().map(Arc::new).collect(),
            routing_policies: routing_policies.into_iter().map(Arc::new).collect(),
            pricing: Arc::new(pricing),
            loaded_at: Utc::now(),
        }
    }
}

/// Holds the current policy snapshot; readers never block on a reload.
///
/// A failed reload keeps the previous snapshot active and surfaces
/// [`Error::PolicyLoad`] to the caller.
pub struct PolicyStore {
    source: Box<dyn PolicySource>,
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    /// Loads the initial snapshot; fails if the source cannot produce one.
    pub fn new(source: Box<dyn PolicySource>) -> Result<Self> {
        let snapshot = Self::load(source.as_ref())?;
        info!(
            budgets = snapshot.budgets.len(),
            routing_policies = snapshot.routing_policies.len(),
            "loaded policy snapshot"
        );
        Ok(Self {
            source,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    fn load(source: &dyn PolicySource) -> Result<PolicySnapshot> {
        Ok(PolicySnapshot::build(
            source.budgets()?,
            source.routing_policies()?,
            source.pricing()?,
        ))
    }

    /// Current snapshot; cheap to clone and safe to hold across calls.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Reloads from the source, swapping the snapshot atomically.
    pub fn reload(&self) -> Result<()> {
        match Self::load(self.source.as_ref()) {
            Ok(snapshot) => {
                info!(
                    budgets = snapshot.budgets.len(),
                    routing_policies = snapshot.routing_policies.len(),
                    "reloaded policy snapshot"
                );
                let snapshot = Arc::new(snapshot);
                match self.snapshot.write() {
                    Ok(mut guard) => *guard = snapshot,
                    Err(poisoned) => *poisoned.into_inner() = snapshot,
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "policy reload failed, keeping previous snapshot");
                Err(Error::PolicyLoad {
                    message: err.to_string(),
                })
            }
        }
    }
}
