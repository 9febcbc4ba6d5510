//! Policy providers: reduce a verification tree to a decision.

pub mod config_policy;
pub mod plugin;

use crate::factory::PluginKind;
use crate::protocol::ExternalPlugin;
use std::sync::Arc;
use vouch_core::{Decision, ResourceKind, Result, VerificationTree};

pub use config_policy::{ConfigPolicy, MatchMode, TimeoutVerdict};
pub use plugin::PluginPolicy;

#[async_trait::async_trait]
pub trait PolicyProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` means no decision could be reached; callers must surface it as
    /// indeterminate, never as allow.
    async fn evaluate(&self, tree: &VerificationTree) -> Result<Decision>;
}

pub struct PolicyKind;

impl PluginKind for PolicyKind {
    type Instance = dyn PolicyProvider;

    const KIND: ResourceKind = ResourceKind::Policy;

    fn external(plugin: ExternalPlugin) -> Result<Arc<dyn PolicyProvider>> {
        Ok(Arc::new(PluginPolicy::new(plugin)))
    }
}
