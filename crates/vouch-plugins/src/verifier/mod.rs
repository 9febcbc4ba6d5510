//! Verifiers: check one referrer and report pass/fail with evidence.
//!
//! A failed check is an `Ok` result with `success == false`. `Err` is kept
//! for infrastructure failures (crashed plugin, unreachable dependency).

pub mod integrity;
pub mod plugin;

use crate::factory::PluginKind;
use crate::protocol::ExternalPlugin;
use bytes::Bytes;
use std::sync::Arc;
use vouch_core::{
    ArtifactReference, PluginConfig, ReferrerDescriptor, ResourceKind, Result, VerificationResult,
};

pub use integrity::IntegrityVerifier;
pub use plugin::PluginVerifier;

/// Config key listing the artifact types a verifier handles.
pub const ARTIFACT_TYPES_KEY: &str = "artifactTypes";

#[async_trait::async_trait]
pub trait ReferenceVerifier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this verifier applies to referrers of `artifact_type`.
    fn can_verify(&self, artifact_type: &str) -> bool;

    /// Must not touch shared state: no registry writes, no other verifier's state.
    async fn verify(
        &self,
        subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
        content: &Bytes,
    ) -> Result<VerificationResult>;
}

/// Artifact types a verifier accepts. `*` accepts everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArtifactTypes(Vec<String>);

impl ArtifactTypes {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(types.into_iter().map(Into::into).collect())
    }

    pub fn any() -> Self {
        Self::new(["*"])
    }

    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        Ok(Self(config.get_string_list(ARTIFACT_TYPES_KEY)?))
    }

    pub fn matches(&self, artifact_type: &str) -> bool {
        self.0.iter().any(|t| t == "*" || t == artifact_type)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct VerifierKind;

impl PluginKind for VerifierKind {
    type Instance = dyn ReferenceVerifier;

    const KIND: ResourceKind = ResourceKind::Verifier;

    fn external(plugin: ExternalPlugin) -> Result<Arc<dyn ReferenceVerifier>> {
        Ok(Arc::new(PluginVerifier::new(plugin)?))
    }
}
