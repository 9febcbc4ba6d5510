//! Live registry of active plugin instances.
//!
//! All three kinds live in one immutable snapshot behind an `Arc`. Readers
//! clone the `Arc` and never wait on a plugin build; writers copy the
//! snapshot, change one entry and swap the pointer, so a reader sees either
//! the old instance or the new one and nothing in between.

use crate::executor::{ComponentSource, Components};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use vouch_core::{ResourceKey, ResourceKind};
use vouch_plugins::{PolicyProvider, ReferenceVerifier, ReferrerStore};

/// One live instance of any kind.
#[derive(Clone)]
pub enum Component {
    Store(Arc<dyn ReferrerStore>),
    Verifier(Arc<dyn ReferenceVerifier>),
    Policy(Arc<dyn PolicyProvider>),
}

impl Component {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Store(_) => ResourceKind::Store,
            Self::Verifier(_) => ResourceKind::Verifier,
            Self::Policy(_) => ResourceKind::Policy,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Store(s) => s.name(),
            Self::Verifier(v) => v.name(),
            Self::Policy(p) => p.name(),
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind(), self.name())
    }
}

/// An immutable view of the registry at one generation.
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    pub generation: u64,
    pub stores: BTreeMap<ResourceKey, Arc<dyn ReferrerStore>>,
    pub verifiers: BTreeMap<ResourceKey, Arc<dyn ReferenceVerifier>>,
    pub policies: BTreeMap<ResourceKey, Arc<dyn PolicyProvider>>,
}

impl RegistrySnapshot {
    pub fn get(&self, kind: ResourceKind, key: &ResourceKey) -> Option<Component> {
        match kind {
            ResourceKind::Store => self.stores.get(key).cloned().map(Component::Store),
            ResourceKind::Verifier => self.verifiers.get(key).cloned().map(Component::Verifier),
            ResourceKind::Policy => self.policies.get(key).cloned().map(Component::Policy),
        }
    }

    pub fn contains(&self, kind: ResourceKind, key: &ResourceKey) -> bool {
        match kind {
            ResourceKind::Store => self.stores.contains_key(key),
            ResourceKind::Verifier => self.verifiers.contains_key(key),
            ResourceKind::Policy => self.policies.contains_key(key),
        }
    }

    pub fn len(&self) -> usize {
        self.stores.len() + self.verifiers.len() + self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct LiveRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl Default for LiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// The current snapshot. Holds the lock only long enough to clone an `Arc`.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    pub fn get(&self, kind: ResourceKind, key: &ResourceKey) -> Option<Component> {
        self.snapshot().get(kind, key)
    }

    pub fn contains(&self, kind: ResourceKind, key: &ResourceKey) -> bool {
        self.current.read().contains(kind, key)
    }

    /// Every instance of `kind`, in resource-key order.
    pub fn list(&self, kind: ResourceKind) -> Vec<(ResourceKey, Component)> {
        let snapshot = self.snapshot();
        match kind {
            ResourceKind::Store => snapshot
                .stores
                .iter()
                .map(|(k, v)| (k.clone(), Component::Store(v.clone())))
                .collect(),
            ResourceKind::Verifier => snapshot
                .verifiers
                .iter()
                .map(|(k, v)| (k.clone(), Component::Verifier(v.clone())))
                .collect(),
            ResourceKind::Policy => snapshot
                .policies
                .iter()
                .map(|(k, v)| (k.clone(), Component::Policy(v.clone())))
                .collect(),
        }
    }

    /// Install `component` at `key`, returning whatever it replaced.
    /// The instance must be fully built before this is called.
    pub fn upsert(&self, key: ResourceKey, component: Component) -> Option<Component> {
        self.update(|next| match component {
            Component::Store(s) => next.stores.insert(key, s).map(Component::Store),
            Component::Verifier(v) => next.verifiers.insert(key, v).map(Component::Verifier),
            Component::Policy(p) => next.policies.insert(key, p).map(Component::Policy),
        })
    }

    /// Drop the instance at `key`. Absent keys leave the registry untouched.
    pub fn remove(&self, kind: ResourceKind, key: &ResourceKey) -> Option<Component> {
        if !self.contains(kind, key) {
            return None;
        }
        self.update(|next| match kind {
            ResourceKind::Store => next.stores.remove(key).map(Component::Store),
            ResourceKind::Verifier => next.verifiers.remove(key).map(Component::Verifier),
            ResourceKind::Policy => next.policies.remove(key).map(Component::Policy),
        })
    }

    /// Copy, modify and publish under the write lock, so concurrent writers
    /// to different keys never lose each other's changes.
    fn update<R>(&self, change: impl FnOnce(&mut RegistrySnapshot) -> R) -> R {
        let mut current = self.current.write();
        let mut next = RegistrySnapshot::clone(&current);
        let out = change(&mut next);
        next.generation = current.generation + 1;
        *current = Arc::new(next);
        out
    }
}

impl ComponentSource for LiveRegistry {
    fn components(&self) -> Components {
        let snapshot = self.snapshot();
        if snapshot.policies.len() > 1 {
            warn!(
                count = snapshot.policies.len(),
                "more than one policy registered, using the first by resource key"
            );
        }
        Components {
            stores: snapshot.stores.values().cloned().collect(),
            verifiers: snapshot.verifiers.values().cloned().collect(),
            policy: snapshot.policies.values().next().cloned(),
        }
    }
}
