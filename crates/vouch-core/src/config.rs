//! Configuration model
//!
//! The bootstrap collaborator hands over one parsed `Config`; every plugin
//! section carries open `PluginConfig` maps that only the chosen plugin decodes.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reserved key naming the plugin a config resolves to.
pub const NAME_KEY: &str = "name";

/// Schema version this build speaks by default.
pub const SPEC_VERSION: &str = "1.0.0";

/// Every schema version this build can decode.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0"];

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Default to `SPEC_VERSION` when unset; reject versions we cannot speak.
pub fn resolve_version(version: Option<&str>) -> Result<String> {
    match version.filter(|v| !v.is_empty()) {
        None => Ok(SPEC_VERSION.to_string()),
        Some(v) if is_supported_version(v) => Ok(v.to_string()),
        Some(v) => Err(Error::config(format!(
            "unsupported config version '{}' (supported: {})",
            v,
            SUPPORTED_VERSIONS.join(", ")
        ))),
    }
}

/// `$VOUCH_CONFIG/plugins`, else `~/.vouch/plugins`.
pub fn default_plugin_dir() -> PathBuf {
    let base = std::env::var_os("VOUCH_CONFIG")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".vouch")))
        .unwrap_or_else(|| PathBuf::from(".vouch"));
    base.join("plugins")
}

// ============================================================
// PluginConfig
// ============================================================

/// Open string-keyed plugin configuration. Only `name` is interpreted here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginConfig(Map<String, Value>);

impl PluginConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(NAME_KEY.to_string(), Value::String(name.into()));
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The plugin name. Absent, empty, or non-string is a config error.
    pub fn name(&self) -> Result<&str> {
        match self.0.get(NAME_KEY) {
            None => Err(Error::config(format!(
                "plugin config has no '{}' key",
                NAME_KEY
            ))),
            Some(Value::String(s)) if !s.is_empty() => Ok(s),
            Some(other) => Err(Error::config(format!(
                "plugin '{}' must be a non-empty string, got {}",
                NAME_KEY, other
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.type_error(key, "a string", other)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.type_error(key, "a boolean", other)),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.type_error(key, "a non-negative integer", v)),
        }
    }

    /// A list given either as an array of strings or as one comma-separated string.
    pub fn get_string_list(&self, key: &str) -> Result<Vec<String>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    other => Err(self.type_error(key, "a list of strings", other)),
                })
                .collect(),
            Some(other) => Err(self.type_error(key, "a string or list of strings", other)),
        }
    }

    /// Decode the whole map into a plugin-specific parameter type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| {
            Error::config(format!(
                "invalid parameters for plugin '{}': {}",
                self.name().unwrap_or("<unnamed>"),
                e
            ))
        })
    }

    fn type_error(&self, key: &str, expected: &str, got: &Value) -> Error {
        Error::config(format!(
            "plugin '{}': '{}' must be {}, got {}",
            self.name().unwrap_or("<unnamed>"),
            key,
            expected,
            got
        ))
    }
}

// ============================================================
// Sections
// ============================================================

/// Top-level configuration handed over by the bootstrap collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub store: PluginListConfig,
    pub verifier: PluginListConfig,
    pub policy: PolicyConfig,
    pub executor: ExecutorConfig,
}

/// An ordered list of plugins sharing a schema version and search path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginListConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub plugin_bin_dirs: Vec<PathBuf>,
    pub plugins: Vec<PluginConfig>,
}

impl PluginListConfig {
    pub fn resolved_version(&self) -> Result<String> {
        resolve_version(self.version.as_deref())
    }

    /// Configured search directories, or just `default_dir` when none are set.
    pub fn search_dirs(&self, default_dir: &Path) -> Vec<PathBuf> {
        search_dirs(&self.plugin_bin_dirs, default_dir)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub plugin_bin_dirs: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginConfig>,
}

impl PolicyConfig {
    pub fn resolved_version(&self) -> Result<String> {
        resolve_version(self.version.as_deref())
    }

    pub fn search_dirs(&self, default_dir: &Path) -> Vec<PathBuf> {
        search_dirs(&self.plugin_bin_dirs, default_dir)
    }
}

fn search_dirs(configured: &[PathBuf], default_dir: &Path) -> Vec<PathBuf> {
    if configured.is_empty() {
        vec![default_dir.to_path_buf()]
    } else {
        configured.to_vec()
    }
}

/// Per-request orchestration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Deadline for one verification request, covering every store call and plugin invocation.
    pub request_timeout_ms: u64,
    /// Referrers deeper than this are recorded as skipped. Direct referrers are depth 1.
    pub max_recursion_depth: u32,
    /// Only list referrers of these artifact types. Empty means all.
    pub artifact_types: Vec<String>,
    /// Referrers of these types are themselves searched for referrers. `*` matches all.
    pub nested_artifact_types: Vec<String>,
    pub plugins: PluginRunnerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_recursion_depth: 3,
            artifact_types: Vec::new(),
            nested_artifact_types: Vec::new(),
            plugins: PluginRunnerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn recurses_into(&self, artifact_type: &str) -> bool {
        self.nested_artifact_types
            .iter()
            .any(|t| t == "*" || t == artifact_type)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_recursion_depth == 0 {
            return Err(Error::config("executor.maxRecursionDepth must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::config("executor.requestTimeoutMs must be positive"));
        }
        self.plugins.validate()
    }
}

/// Limits applied to every out-of-process plugin call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginRunnerConfig {
    pub timeout_ms: u64,
    pub max_concurrent_invocations: usize,
}

impl Default for PluginRunnerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_concurrent_invocations: 16,
        }
    }
}

impl PluginRunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::config("executor.plugins.timeoutMs must be positive"));
        }
        if self.max_concurrent_invocations == 0 {
            return Err(Error::config(
                "executor.plugins.maxConcurrentInvocations must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Parse an already-read JSON document and validate the executor section.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.executor.validate()?;
        Ok(config)
    }
}
