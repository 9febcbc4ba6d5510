//! Vouch Executor - request orchestration over a live plugin registry
//!
//! - `executor`: walks the referrer graph of one subject and asks the policy for a decision
//! - `registry`: the live, atomically swapped set of store/verifier/policy instances
//! - `reconcile`: applies create/update/delete events from a resource controller
//! - `bootstrap`: a fixed component set built once from a parsed `Config`

pub mod bootstrap;
pub mod executor;
pub mod reconcile;
pub mod registry;

pub use bootstrap::StaticComponents;
pub use executor::{ComponentSource, Components, Executor};
pub use reconcile::{
    spec_to_plugin_config, ReconcileEvent, ReconcileOutcome, Reconciler, ResourceSpec,
};
pub use registry::{Component, LiveRegistry, RegistrySnapshot};
