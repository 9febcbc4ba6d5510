//! Store backed by an external plugin executable.

use super::ReferrerStore;
use crate::protocol::{ExternalPlugin, PluginCommand, PluginResponse};
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use vouch_core::{
    ArtifactReference, Error, InvocationFailure, ReferrerDescriptor, ReferrerPage, Result,
};

pub struct PluginStore {
    plugin: ExternalPlugin,
}

impl PluginStore {
    pub fn new(plugin: ExternalPlugin) -> Self {
        Self { plugin }
    }

    async fn call(
        &self,
        command: PluginCommand,
        subject: &ArtifactReference,
        payload: Value,
    ) -> Result<PluginResponse> {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let response = self.plugin.invoke(command, Some(subject), payload).await?;
        if !response.success {
            return Err(Error::store(self.plugin.name(), response.message));
        }
        Ok(response)
    }

    fn malformed(&self, detail: String) -> Error {
        Error::invocation(self.plugin.name(), InvocationFailure::MalformedOutput(detail))
    }

    fn content(&self, response: &PluginResponse) -> Result<Bytes> {
        let encoded: String = response
            .field("content")
            .map_err(|e| self.malformed(e))?
            .ok_or_else(|| self.malformed("result has no content".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| self.malformed(format!("content is not base64: {}", e)))
    }
}

#[async_trait::async_trait]
impl ReferrerStore for PluginStore {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    async fn list_referrers(
        &self,
        subject: &ArtifactReference,
        artifact_types: &[String],
        next_token: Option<&str>,
    ) -> Result<ReferrerPage> {
        let response = self
            .call(
                PluginCommand::ListReferrers,
                subject,
                json!({ "artifactTypes": artifact_types, "nextToken": next_token }),
            )
            .await?;
        let referrers: Vec<ReferrerDescriptor> = response
            .field("referrers")
            .map_err(|e| self.malformed(e))?
            .unwrap_or_default();
        let next_token: Option<String> = response.field("nextToken").map_err(|e| self.malformed(e))?;
        Ok(ReferrerPage {
            referrers,
            next_token,
        })
    }

    async fn get_manifest(
        &self,
        subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
    ) -> Result<Bytes> {
        let response = self
            .call(PluginCommand::GetManifest, subject, json!({ "referrer": referrer }))
            .await?;
        self.content(&response)
    }

    async fn get_blob_content(&self, subject: &ArtifactReference, digest: &str) -> Result<Bytes> {
        let response = self
            .call(PluginCommand::GetBlobContent, subject, json!({ "digest": digest }))
            .await?;
        self.content(&response)
    }
}
