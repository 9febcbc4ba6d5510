//! A fixed component set built once from a parsed configuration.

use crate::executor::{ComponentSource, Components};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use vouch_core::{Config, Error, Result};
use vouch_plugins::{Factories, PolicyProvider, ReferenceVerifier, ReferrerStore};

pub struct StaticComponents {
    pub stores: Vec<Arc<dyn ReferrerStore>>,
    pub verifiers: Vec<Arc<dyn ReferenceVerifier>>,
    pub policy: Arc<dyn PolicyProvider>,
}

impl StaticComponents {
    /// Build every store, verifier and the policy named in `config`.
    /// Any single failure fails the whole set.
    pub fn from_config(config: &Config, factories: &Factories, default_plugin_dir: &Path) -> Result<Self> {
        let stores = factories
            .stores
            .create_many_from_config(&config.store, default_plugin_dir)?;
        let verifiers = factories
            .verifiers
            .create_many_from_config(&config.verifier, default_plugin_dir)?;

        let plugin = config
            .policy
            .plugin
            .as_ref()
            .ok_or_else(|| Error::config("policy section must name a plugin"))?;
        let version = config.policy.resolved_version()?;
        let policy = factories.policies.create_from_config(
            plugin,
            &version,
            &config.policy.search_dirs(default_plugin_dir),
        )?;

        info!(
            stores = stores.len(),
            verifiers = verifiers.len(),
            policy = policy.name(),
            "components built from config"
        );
        Ok(Self {
            stores,
            verifiers,
            policy,
        })
    }
}

impl ComponentSource for StaticComponents {
    fn components(&self) -> Components {
        Components {
            stores: self.stores.clone(),
            verifiers: self.verifiers.clone(),
            policy: Some(Arc::clone(&self.policy)),
        }
    }
}
