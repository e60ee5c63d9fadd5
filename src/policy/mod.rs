//! Policy model: budget specifications, routing policies, storage, and
//! per-run resolution.

pub mod budget;
pub mod resolver;
pub mod routing;
pub mod store;

pub use budget::{
    BudgetSpec, HardLimitAction, MatchSpec, Period, RunConstraints, Scope, ThresholdAction,
};
pub use resolver::{EffectiveConstraints, ResolvedPolicies, RunIds, resolve};
pub use routing::{DowngradeReason, DowngradeTrigger, RoutingPolicy, StageConfig};
pub use store::{PolicySnapshot, PolicySource, PolicyStore, StaticPolicySource};
