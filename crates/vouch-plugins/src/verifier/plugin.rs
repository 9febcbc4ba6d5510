//! Verifier backed by an external plugin executable.

use super::{ArtifactTypes, ReferenceVerifier};
use crate::protocol::{ExternalPlugin, PluginCommand};
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use vouch_core::{
    ArtifactReference, Error, ReferrerDescriptor, Result, VerificationResult,
};

pub struct PluginVerifier {
    plugin: ExternalPlugin,
    artifact_types: ArtifactTypes,
}

impl PluginVerifier {
    /// External verifiers must say which artifact types they handle.
    pub fn new(plugin: ExternalPlugin) -> Result<Self> {
        let artifact_types = ArtifactTypes::from_config(plugin.config())?;
        if artifact_types.is_empty() {
            return Err(Error::config(format!(
                "verifier plugin '{}' must declare artifactTypes",
                plugin.name()
            )));
        }
        Ok(Self {
            plugin,
            artifact_types,
        })
    }
}

#[async_trait::async_trait]
impl ReferenceVerifier for PluginVerifier {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    fn can_verify(&self, artifact_type: &str) -> bool {
        self.artifact_types.matches(artifact_type)
    }

    async fn verify(
        &self,
        subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
        content: &Bytes,
    ) -> Result<VerificationResult> {
        let payload = match json!({
            "referrer": referrer,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let response = self
            .plugin
            .invoke(PluginCommand::Verify, Some(subject), payload)
            .await?;

        let extensions = if response.extensions.is_empty() {
            Value::Null
        } else {
            Value::Object(response.extensions)
        };
        let result = if response.success {
            VerificationResult::passed(self.name(), referrer, response.message)
        } else {
            VerificationResult::failed(self.name(), referrer, response.message)
        };
        Ok(result.with_extensions(extensions))
    }
}
