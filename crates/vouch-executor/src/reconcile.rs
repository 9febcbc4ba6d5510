//! Reconciliation: keep the live registry in step with declared resources.
//!
//! A resource controller calls `handle` with one event per create, update or
//! delete. Events for one resource key are applied one at a time; different
//! keys proceed concurrently. A failed build never touches the registry, so
//! whatever instance was live before stays live.

use crate::registry::{Component, LiveRegistry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use vouch_core::{
    resolve_version, Error, PluginConfig, ResourceKey, ResourceKind, Result, NAME_KEY,
};
use vouch_plugins::verifier::ARTIFACT_TYPES_KEY;
use vouch_plugins::Factories;

/// The declarative spec of one store, verifier or policy resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Plugin name: a built-in or an executable under the search directory.
    pub name: String,
    pub version: Option<String>,
    /// Directory holding the plugin executable. Empty means the default directory.
    pub address: Option<String>,
    /// Comma-separated artifact types, verifiers only.
    pub artifact_types: Option<String>,
    /// Plugin-defined parameters. Must be an object when present.
    pub parameters: Option<Value>,
}

#[derive(Clone, Debug)]
pub enum ReconcileEvent {
    Upsert {
        kind: ResourceKind,
        key: ResourceKey,
        spec: ResourceSpec,
    },
    Delete {
        kind: ResourceKind,
        key: ResourceKey,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new instance is live at the key.
    Applied,
    /// The instance at the key was dropped.
    Removed,
    /// Nothing to do: same spec already live, or deleting an absent key.
    Unchanged,
}

/// Build the plugin config for `spec`: parameters, then the name, then
/// the artifact types.
pub fn spec_to_plugin_config(spec: &ResourceSpec) -> Result<PluginConfig> {
    if spec.name.trim().is_empty() {
        return Err(Error::config("resource spec has no plugin name"));
    }
    let mut config = match &spec.parameters {
        None | Some(Value::Null) => PluginConfig::default(),
        Some(Value::Object(map)) => PluginConfig::from_map(map.clone()),
        Some(other) => {
            return Err(Error::config(format!(
                "parameters of '{}' must be an object, got {}",
                spec.name, other
            )))
        }
    };
    config.insert(NAME_KEY, spec.name.as_str());
    if let Some(types) = spec.artifact_types.as_deref().filter(|t| !t.trim().is_empty()) {
        config.insert(ARTIFACT_TYPES_KEY, types);
    }
    Ok(config)
}

type KeyState = Arc<Mutex<Option<ResourceSpec>>>;

pub struct Reconciler {
    registry: Arc<LiveRegistry>,
    factories: Arc<Factories>,
    default_plugin_dir: PathBuf,
    /// Last applied spec per key; the mutex orders events for that key.
    keys: DashMap<(ResourceKind, ResourceKey), KeyState>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<LiveRegistry>,
        factories: Arc<Factories>,
        default_plugin_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            factories,
            default_plugin_dir: default_plugin_dir.into(),
            keys: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<LiveRegistry> {
        &self.registry
    }

    pub async fn handle(&self, event: ReconcileEvent) -> Result<ReconcileOutcome> {
        match event {
            ReconcileEvent::Upsert { kind, key, spec } => self.upsert(kind, key, spec).await,
            ReconcileEvent::Delete { kind, key } => self.remove(kind, &key).await,
        }
    }

    /// Build an instance from `spec` and swap it in at `key`.
    pub async fn upsert(
        &self,
        kind: ResourceKind,
        key: ResourceKey,
        spec: ResourceSpec,
    ) -> Result<ReconcileOutcome> {
        let state = self.key_state(kind, &key);
        let mut applied = state.lock().await;
        if applied.as_ref() == Some(&spec) && self.registry.contains(kind, &key) {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let component = match self.build(kind, &spec) {
            Ok(component) => component,
            Err(e) => {
                error!(
                    kind = %kind,
                    resource = %key,
                    plugin = %spec.name,
                    error = %e,
                    "reconcile failed, previous instance kept"
                );
                return Err(e);
            }
        };

        let replaced = self.registry.upsert(key.clone(), component);
        *applied = Some(spec);
        info!(
            kind = %kind,
            resource = %key,
            replaced = replaced.is_some(),
            generation = self.registry.generation(),
            "resource applied"
        );
        Ok(ReconcileOutcome::Applied)
    }

    pub async fn remove(&self, kind: ResourceKind, key: &ResourceKey) -> Result<ReconcileOutcome> {
        let state = self.key_state(kind, key);
        let removed = {
            let mut applied = state.lock().await;
            *applied = None;
            self.registry.remove(kind, key)
        };
        drop(state);
        self.forget_if_idle(kind, key);

        match removed {
            Some(_) => {
                info!(kind = %kind, resource = %key, "resource removed");
                Ok(ReconcileOutcome::Removed)
            }
            None => Ok(ReconcileOutcome::Unchanged),
        }
    }

    /// Number of keys with reconcile state held.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    /// Drop the per-key state once nothing is applied and no event holds it.
    fn forget_if_idle(&self, kind: ResourceKind, key: &ResourceKey) {
        self.keys.remove_if(&(kind, key.clone()), |_, state| {
            Arc::strong_count(state) == 1
                && state.try_lock().map(|applied| applied.is_none()).unwrap_or(false)
        });
    }

    fn key_state(&self, kind: ResourceKind, key: &ResourceKey) -> KeyState {
        self.keys
            .entry((kind, key.clone()))
            .or_default()
            .value()
            .clone()
    }

    fn build(&self, kind: ResourceKind, spec: &ResourceSpec) -> Result<Component> {
        let config = spec_to_plugin_config(spec)?;
        let version = resolve_version(spec.version.as_deref())?;
        let dirs = match spec.address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => vec![PathBuf::from(address)],
            _ => vec![self.default_plugin_dir.clone()],
        };

        Ok(match kind {
            ResourceKind::Store => Component::Store(
                self.factories.stores.create_from_config(&config, &version, &dirs)?,
            ),
            ResourceKind::Verifier => Component::Verifier(
                self.factories.verifiers.create_from_config(&config, &version, &dirs)?,
            ),
            ResourceKind::Policy => Component::Policy(
                self.factories.policies.create_from_config(&config, &version, &dirs)?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_translation_merges_name_and_types() {
        let spec = ResourceSpec {
            name: "notation".into(),
            artifact_types: Some("application/vnd.cncf.notary.signature".into()),
            parameters: Some(json!({"trustPolicy": "strict", "name": "ignored"})),
            ..Default::default()
        };
        let config = spec_to_plugin_config(&spec).unwrap();
        assert_eq!(config.name().unwrap(), "notation");
        assert_eq!(config.get_str("trustPolicy").unwrap(), Some("strict"));
        assert_eq!(
            config.get_string_list("artifactTypes").unwrap(),
            vec!["application/vnd.cncf.notary.signature"]
        );
    }

    #[test]
    fn non_object_parameters_are_rejected() {
        let spec = ResourceSpec {
            name: "notation".into(),
            parameters: Some(json!(["a"])),
            ..Default::default()
        };
        assert!(matches!(spec_to_plugin_config(&spec), Err(Error::Config(_))));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(matches!(
            spec_to_plugin_config(&ResourceSpec::default()),
            Err(Error::Config(_))
        ));
    }
}
