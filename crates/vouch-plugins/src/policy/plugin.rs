//! Policy backed by an external plugin executable.
//!
//! The plugin receives `{"tree": ...}` and answers with `success` (allow or
//! deny), optionally overriding the verdict with `"verdict"` and listing
//! `"reasons"`.

use super::PolicyProvider;
use crate::protocol::{ExternalPlugin, PluginCommand};
use serde_json::Map;
use vouch_core::{Decision, Error, Result, Verdict, VerificationTree};

pub struct PluginPolicy {
    plugin: ExternalPlugin,
}

impl PluginPolicy {
    pub fn new(plugin: ExternalPlugin) -> Self {
        Self { plugin }
    }
}

#[async_trait::async_trait]
impl PolicyProvider for PluginPolicy {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    async fn evaluate(&self, tree: &VerificationTree) -> Result<Decision> {
        let mut payload = Map::new();
        payload.insert("tree".into(), serde_json::to_value(tree)?);
        let response = self
            .plugin
            .invoke(PluginCommand::Evaluate, Some(&tree.subject), payload)
            .await?;

        let malformed = |e: String| Error::policy(format!("policy plugin '{}': {}", self.name(), e));
        let verdict = response
            .field::<Verdict>("verdict")
            .map_err(malformed)?
            .unwrap_or(if response.success { Verdict::Allow } else { Verdict::Deny });
        if verdict == Verdict::Allow && !response.success {
            return Err(malformed("verdict allow contradicts success=false".into()));
        }
        let mut reasons = response
            .field::<Vec<String>>("reasons")
            .map_err(malformed)?
            .unwrap_or_default();
        if reasons.is_empty() && verdict != Verdict::Allow && !response.message.is_empty() {
            reasons.push(response.message.clone());
        }
        Ok(Decision::new(verdict, reasons, tree.clone()))
    }
}
