//! Vouch Core - data model, configuration, and error handling

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    default_plugin_dir, is_supported_version, resolve_version, Config, ExecutorConfig, PluginConfig,
    PluginListConfig, PluginRunnerConfig, PolicyConfig, NAME_KEY, SPEC_VERSION,
    SUPPORTED_VERSIONS,
};
pub use error::{Error, InvocationFailure, Result};
pub use types::*;
