//! `integrity` built-in verifier: the fetched referrer content must match
//! the size and sha256 digest its descriptor advertises.

use super::{ArtifactTypes, ReferenceVerifier};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use vouch_core::{
    sha256_digest, ArtifactReference, PluginConfig, ReferrerDescriptor, Result, VerificationResult,
};

pub const NAME: &str = "integrity";

pub struct IntegrityVerifier {
    name: String,
    artifact_types: ArtifactTypes,
}

impl IntegrityVerifier {
    pub fn new(name: impl Into<String>, artifact_types: ArtifactTypes) -> Self {
        Self {
            name: name.into(),
            artifact_types,
        }
    }

    /// Unset `artifactTypes` means every type.
    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let types = ArtifactTypes::from_config(config)?;
        let types = if types.is_empty() { ArtifactTypes::any() } else { types };
        Ok(Self::new(config.name()?, types))
    }

    pub fn create(_version: &str, config: &PluginConfig) -> Result<Arc<dyn ReferenceVerifier>> {
        Ok(Arc::new(Self::from_config(config)?))
    }
}

#[async_trait::async_trait]
impl ReferenceVerifier for IntegrityVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_verify(&self, artifact_type: &str) -> bool {
        self.artifact_types.matches(artifact_type)
    }

    async fn verify(
        &self,
        _subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
        content: &Bytes,
    ) -> Result<VerificationResult> {
        if content.len() as u64 != referrer.size {
            return Ok(VerificationResult::failed(
                &self.name,
                referrer,
                format!("size mismatch: descriptor {} bytes, content {} bytes", referrer.size, content.len()),
            ));
        }
        if !referrer.digest.starts_with("sha256:") {
            return Ok(VerificationResult::failed(
                &self.name,
                referrer,
                format!("unsupported digest algorithm in {}", referrer.digest),
            ));
        }

        let computed = sha256_digest(content);
        let extensions = json!({ "computedDigest": computed });
        if computed == referrer.digest {
            Ok(VerificationResult::passed(&self.name, referrer, "content matches descriptor")
                .with_extensions(extensions))
        } else {
            Ok(VerificationResult::failed(&self.name, referrer, "digest mismatch")
                .with_extensions(extensions))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> ArtifactReference {
        ArtifactReference::new("app", sha256_digest(b"image"))
    }

    #[tokio::test]
    async fn matching_content_passes() {
        let v = IntegrityVerifier::new("integrity", ArtifactTypes::any());
        let d = ReferrerDescriptor::for_content("sig", b"payload");
        let r = v.verify(&subject(), &d, &Bytes::from_static(b"payload")).await.unwrap();
        assert!(r.success);
        assert_eq!(r.extensions["computedDigest"], d.digest);
    }

    #[tokio::test]
    async fn tampered_content_fails_without_error() {
        let v = IntegrityVerifier::new("integrity", ArtifactTypes::any());
        let d = ReferrerDescriptor::for_content("sig", b"payload");
        let r = v.verify(&subject(), &d, &Bytes::from_static(b"paYload")).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.message, "digest mismatch");

        let r = v.verify(&subject(), &d, &Bytes::from_static(b"short")).await.unwrap();
        assert!(!r.success);
        assert!(r.message.contains("size mismatch"));
    }

    #[test]
    fn defaults_to_every_artifact_type() {
        let v = IntegrityVerifier::from_config(&PluginConfig::new("integrity")).unwrap();
        assert!(v.can_verify("anything"));
        let v = IntegrityVerifier::from_config(&PluginConfig::new("integrity").with("artifactTypes", "sig")).unwrap();
        assert!(v.can_verify("sig"));
        assert!(!v.can_verify("sbom"));
    }
}
