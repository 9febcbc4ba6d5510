//! Vouch plugins: stores, verifiers and policies, built-in or external.
//!
//! Each kind has a trait, an in-process built-in and an adapter that speaks
//! the plugin protocol to an executable. To add a built-in: implement the
//! trait, register it in `default_factories` below.

pub mod factory;
pub mod policy;
pub mod protocol;
pub mod store;
pub mod verifier;

pub use factory::{BuiltinFactory, Factory, PluginKind};
pub use policy::{ConfigPolicy, MatchMode, PluginPolicy, PolicyKind, PolicyProvider, TimeoutVerdict};
pub use protocol::{ExternalPlugin, PluginBinary, PluginCommand, PluginResponse, PluginRunner};
pub use store::{
    collect_referrers, referrers, MemoryStore, PluginStore, ReferrerStore, StoreKind, MAX_REFERRERS,
    MAX_REFERRER_PAGES,
};
pub use verifier::{ArtifactTypes, IntegrityVerifier, PluginVerifier, ReferenceVerifier, VerifierKind};

/// One factory per plugin kind, sharing a process runner.
pub struct Factories {
    pub stores: Factory<StoreKind>,
    pub verifiers: Factory<VerifierKind>,
    pub policies: Factory<PolicyKind>,
}

impl Factories {
    /// Factories with no built-ins; every name resolves to an executable.
    pub fn empty(runner: PluginRunner) -> Self {
        Self {
            stores: Factory::new(runner.clone()),
            verifiers: Factory::new(runner.clone()),
            policies: Factory::new(runner),
        }
    }
}

/// Factories with every built-in registered.
pub fn default_factories(runner: PluginRunner) -> Factories {
    let mut factories = Factories::empty(runner);

    // --- Stores ---
    factories.stores.register(store::memory::NAME, MemoryStore::create);

    // --- Verifiers ---
    factories.verifiers.register(verifier::integrity::NAME, IntegrityVerifier::create);

    // --- Policies ---
    factories.policies.register(policy::config_policy::NAME, ConfigPolicy::create);

    factories
}
