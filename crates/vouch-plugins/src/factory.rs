//! Plugin factory: resolves a `PluginConfig` to a built-in implementation or
//! to an external executable driven through the plugin protocol.
//!
//! Built-ins are registered once at startup. An unknown name is never an
//! error by itself; it is looked up as an executable in the search dirs.

use crate::protocol::{validate_plugin_name, ExternalPlugin, PluginBinary, PluginRunner};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vouch_core::{
    is_supported_version, Error, PluginConfig, PluginListConfig, ResourceKind, Result,
    SUPPORTED_VERSIONS,
};

/// Ties a plugin kind to its trait object and to its protocol-backed adapter.
pub trait PluginKind: Send + Sync + 'static {
    type Instance: ?Sized + Send + Sync;

    const KIND: ResourceKind;

    /// Wrap a located executable as an instance of this kind.
    fn external(plugin: ExternalPlugin) -> Result<Arc<Self::Instance>>;
}

/// Constructs one built-in plugin from its config.
pub trait BuiltinFactory<T: ?Sized>: Send + Sync {
    fn create(&self, version: &str, config: &PluginConfig) -> Result<Arc<T>>;
}

impl<T, F> BuiltinFactory<T> for F
where
    T: ?Sized,
    F: Fn(&str, &PluginConfig) -> Result<Arc<T>> + Send + Sync,
{
    fn create(&self, version: &str, config: &PluginConfig) -> Result<Arc<T>> {
        self(version, config)
    }
}

pub struct Factory<K: PluginKind> {
    builtins: HashMap<String, Box<dyn BuiltinFactory<K::Instance>>>,
    runner: PluginRunner,
    _kind: PhantomData<K>,
}

impl<K: PluginKind> Factory<K> {
    pub fn new(runner: PluginRunner) -> Self {
        Self {
            builtins: HashMap::new(),
            runner,
            _kind: PhantomData,
        }
    }

    /// Register a built-in. A duplicate name is reported, not replaced.
    pub fn try_register(
        &mut self,
        name: &str,
        factory: impl BuiltinFactory<K::Instance> + 'static,
    ) -> Result<()> {
        validate_plugin_name(name)?;
        if self.builtins.contains_key(name) {
            return Err(Error::factory(format!(
                "{} factory named '{}' already registered",
                K::KIND,
                name
            )));
        }
        self.builtins.insert(name.to_string(), Box::new(factory));
        Ok(())
    }

    /// Register a built-in at startup.
    ///
    /// # Panics
    /// On a duplicate or invalid name: two built-ins claiming one name is a
    /// programming error, not something to recover from at runtime.
    pub fn register(&mut self, name: &str, factory: impl BuiltinFactory<K::Instance> + 'static) {
        if let Err(e) = self.try_register(name, factory) {
            panic!("{}", e);
        }
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    pub fn builtin_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builtins.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn runner(&self) -> &PluginRunner {
        &self.runner
    }

    /// Build one instance. Fails with a config error when the name key is
    /// missing and with a factory error for unsafe or unresolvable names.
    pub fn create_from_config(
        &self,
        config: &PluginConfig,
        version: &str,
        plugin_dirs: &[PathBuf],
    ) -> Result<Arc<K::Instance>> {
        let name = config.name()?;
        validate_plugin_name(name)?;
        if !is_supported_version(version) {
            return Err(Error::config(format!(
                "unsupported {} config version '{}' (supported: {})",
                K::KIND,
                version,
                SUPPORTED_VERSIONS.join(", ")
            )));
        }

        if let Some(factory) = self.builtins.get(name) {
            debug!(kind = %K::KIND, plugin = name, "creating built-in plugin");
            return factory.create(version, config);
        }

        let binary = PluginBinary::locate(name, plugin_dirs)?;
        debug!(kind = %K::KIND, plugin = name, path = %binary.path.display(), "resolved external plugin");
        K::external(ExternalPlugin::new(
            binary,
            version,
            config.clone(),
            self.runner.clone(),
        ))
    }

    /// Build every plugin in `list`, in order. All-or-nothing: the first
    /// failure is returned and nothing built so far escapes.
    pub fn create_many_from_config(
        &self,
        list: &PluginListConfig,
        default_plugin_dir: &Path,
    ) -> Result<Vec<Arc<K::Instance>>> {
        let version = list.resolved_version()?;
        if list.plugins.is_empty() {
            return Err(Error::config(format!(
                "{} config should have at least one plugin",
                K::KIND
            )));
        }
        let dirs = list.search_dirs(default_plugin_dir);

        let instances = list
            .plugins
            .iter()
            .map(|config| self.create_from_config(config, &version, &dirs))
            .collect::<Result<Vec<_>>>()?;

        info!(kind = %K::KIND, count = instances.len(), "plugins created from config");
        Ok(instances)
    }
}
