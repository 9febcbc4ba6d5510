//! Core types for Vouch

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// An artifact addressed by content digest. The tag is advisory only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub repository: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ArtifactReference {
    pub fn new(repository: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            digest: digest.into(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Parse `repository[:tag]@algorithm:hex`. A reference without a digest
    /// is rejected: tags are mutable and cannot identify what was verified.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (name, digest) = input
            .split_once('@')
            .ok_or_else(|| Error::InvalidReference(format!("'{}' has no digest", input)))?;
        validate_digest(digest)?;

        // A ':' before the last '/' belongs to a registry port, not a tag.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(&name[split + 1..]))
            }
            None => (name, None),
        };

        if repository.is_empty() {
            return Err(Error::InvalidReference(format!("'{}' has no repository", input)));
        }
        if tag.is_some_and(str::is_empty) {
            return Err(Error::InvalidReference(format!("'{}' has an empty tag", input)));
        }

        Ok(Self {
            repository: repository.to_string(),
            digest: digest.to_string(),
            tag: tag.map(String::from),
        })
    }
}

impl std::fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        write!(f, "@{}", self.digest)
    }
}

/// Check `algorithm:encoded` digest syntax. sha256/sha512 lengths are enforced.
pub fn validate_digest(digest: &str) -> Result<()> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| Error::InvalidReference(format!("digest '{}' has no algorithm", digest)))?;
    if algorithm.is_empty()
        || !algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
    {
        return Err(Error::InvalidReference(format!(
            "digest '{}' has an invalid algorithm",
            digest
        )));
    }
    if encoded.is_empty() || !encoded.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(Error::InvalidReference(format!(
            "digest '{}' is not lowercase hex",
            digest
        )));
    }
    let expected_len = match algorithm {
        "sha256" => Some(64),
        "sha512" => Some(128),
        _ => None,
    };
    if let Some(len) = expected_len {
        if encoded.len() != len {
            return Err(Error::InvalidReference(format!(
                "{} digest must be {} hex characters, got {}",
                algorithm,
                len,
                encoded.len()
            )));
        }
    }
    Ok(())
}

/// `sha256:<hex>` of the given bytes.
pub fn sha256_digest(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

/// A referrer as reported by a store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrerDescriptor {
    pub digest: String,
    pub artifact_type: String,
    pub size: u64,
}

impl ReferrerDescriptor {
    pub fn new(digest: impl Into<String>, artifact_type: impl Into<String>, size: u64) -> Self {
        Self {
            digest: digest.into(),
            artifact_type: artifact_type.into(),
            size,
        }
    }

    /// Descriptor whose digest and size are derived from `content`.
    pub fn for_content(artifact_type: impl Into<String>, content: &[u8]) -> Self {
        Self::new(sha256_digest(content), artifact_type, content.len() as u64)
    }

    /// Address this referrer as a subject in the same repository.
    pub fn as_subject(&self, repository: &str) -> ArtifactReference {
        ArtifactReference::new(repository, self.digest.clone())
    }
}

/// One page of a referrer listing. `next_token` is `None` on the last page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrerPage {
    pub referrers: Vec<ReferrerDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Why a referrer was recorded without running a verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    NoVerifier,
    DepthExceeded,
    Cycle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResultStatus {
    /// A verifier ran and reported; `success` carries its verdict.
    Verified,
    Skipped { reason: SkipReason },
    TimedOut,
    /// Infrastructure failure of the verifier or of fetching its input.
    Errored,
}

/// Outcome of checking one referrer, with the referrer's own referrers nested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub success: bool,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier_name: Option<String>,
    pub artifact_type: String,
    pub referrer_digest: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extensions: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<VerificationResult>,
}

impl VerificationResult {
    fn build(
        success: bool,
        status: ResultStatus,
        verifier: Option<&str>,
        referrer: &ReferrerDescriptor,
        message: String,
    ) -> Self {
        Self {
            success,
            status,
            verifier_name: verifier.map(String::from),
            artifact_type: referrer.artifact_type.clone(),
            referrer_digest: referrer.digest.clone(),
            message,
            extensions: Value::Null,
            nested: Vec::new(),
        }
    }

    pub fn passed(verifier: &str, referrer: &ReferrerDescriptor, message: impl Into<String>) -> Self {
        Self::build(true, ResultStatus::Verified, Some(verifier), referrer, message.into())
    }

    pub fn failed(verifier: &str, referrer: &ReferrerDescriptor, message: impl Into<String>) -> Self {
        Self::build(false, ResultStatus::Verified, Some(verifier), referrer, message.into())
    }

    pub fn skipped(referrer: &ReferrerDescriptor, reason: SkipReason) -> Self {
        let message = match reason {
            SkipReason::NoVerifier => {
                format!("no verifier configured for artifact type '{}'", referrer.artifact_type)
            }
            SkipReason::DepthExceeded => "maximum referrer depth exceeded".to_string(),
            SkipReason::Cycle => "referrer already visited on this path".to_string(),
        };
        Self::build(false, ResultStatus::Skipped { reason }, None, referrer, message)
    }

    pub fn timed_out(verifier: Option<&str>, referrer: &ReferrerDescriptor, message: impl Into<String>) -> Self {
        Self::build(false, ResultStatus::TimedOut, verifier, referrer, message.into())
    }

    pub fn errored(verifier: Option<&str>, referrer: &ReferrerDescriptor, message: impl Into<String>) -> Self {
        Self::build(false, ResultStatus::Errored, verifier, referrer, message.into())
    }

    pub fn with_extensions(mut self, extensions: Value) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_nested(mut self, nested: Vec<VerificationResult>) -> Self {
        self.nested = nested;
        self
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, ResultStatus::Skipped { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.status {
            ResultStatus::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    /// Depth-first walk over this result and everything nested under it.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a VerificationResult)) {
        visit(self);
        for child in &self.nested {
            child.walk(visit);
        }
    }
}

/// Every result produced for one subject, in referrer discovery order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationTree {
    pub subject: ArtifactReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    pub results: Vec<VerificationResult>,
}

impl VerificationTree {
    pub fn new(subject: ArtifactReference, results: Vec<VerificationResult>) -> Self {
        Self {
            subject,
            store: None,
            results,
        }
    }

    /// Flattened view of every result at any depth.
    pub fn all_results(&self) -> Vec<&VerificationResult> {
        let mut out = Vec::new();
        for result in &self.results {
            result.walk(&mut |r| out.push(r));
        }
        out
    }

    /// Digests of referrers a verifier actually ran against, at any depth.
    /// Each digest appears once, in discovery order.
    pub fn verified_digests(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.all_results()
            .into_iter()
            .filter(|r| r.status == ResultStatus::Verified)
            .map(|r| r.referrer_digest.as_str())
            .filter(|digest| seen.insert(*digest))
            .collect()
    }

    pub fn find(&self, referrer_digest: &str) -> Vec<&VerificationResult> {
        self.all_results()
            .into_iter()
            .filter(|r| r.referrer_digest == referrer_digest)
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
    /// The policy could not reach a decision. Never treated as allow.
    Indeterminate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Allow => f.write_str("allow"),
            Verdict::Deny => f.write_str("deny"),
            Verdict::Indeterminate => f.write_str("indeterminate"),
        }
    }
}

/// Terminal output of one verification request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub tree: VerificationTree,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(verdict: Verdict, reasons: Vec<String>, tree: VerificationTree) -> Self {
        Self {
            verdict,
            reasons,
            tree,
            evaluated_at: Utc::now(),
        }
    }

    pub fn allow(tree: VerificationTree) -> Self {
        Self::new(Verdict::Allow, Vec::new(), tree)
    }

    pub fn deny(tree: VerificationTree, reasons: Vec<String>) -> Self {
        Self::new(Verdict::Deny, reasons, tree)
    }

    pub fn indeterminate(tree: VerificationTree, reason: impl Into<String>) -> Self {
        Self::new(Verdict::Indeterminate, vec![reason.into()], tree)
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

/// Identifier of a declarative resource: `namespace/name`. Cheaply cloneable.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(Arc::from(name))
        } else {
            Self(Arc::from(format!("{}/{}", namespace, name)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three plugin kinds the registry holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Store,
    Verifier,
    Policy,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Store => f.write_str("store"),
            ResourceKind::Verifier => f.write_str("verifier"),
            ResourceKind::Policy => f.write_str("policy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7";

    #[test]
    fn parse_reference_with_tag_and_port() {
        let r = ArtifactReference::parse(&format!("localhost:5000/team/app:v1@{}", DIGEST)).unwrap();
        assert_eq!(r.repository, "localhost:5000/team/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.digest, DIGEST);
        assert_eq!(r.to_string(), format!("localhost:5000/team/app:v1@{}", DIGEST));
    }

    #[test]
    fn parse_reference_without_tag() {
        let r = ArtifactReference::parse(&format!("localhost:5000/app@{}", DIGEST)).unwrap();
        assert_eq!(r.repository, "localhost:5000/app");
        assert!(r.tag.is_none());
    }

    #[test]
    fn parse_rejects_tag_only_reference() {
        let err = ArtifactReference::parse("registry.io/app:latest").unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }

    #[test]
    fn digest_validation() {
        assert!(validate_digest(DIGEST).is_ok());
        assert!(validate_digest("sha256:abc").is_err());
        assert!(validate_digest("sha256:").is_err());
        assert!(validate_digest("nocolon").is_err());
        assert!(validate_digest("SHA256:abcd").is_err());
        assert!(validate_digest("blake3:abcd01").is_ok());
        assert!(validate_digest(&DIGEST.to_uppercase().replace("SHA256", "sha256")).is_err());
    }

    #[test]
    fn descriptor_for_content_matches_digest() {
        let d = ReferrerDescriptor::for_content("application/spdx+json", b"hello");
        assert_eq!(d.size, 5);
        assert_eq!(
            d.digest,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(validate_digest(&d.digest).is_ok());
    }

    #[test]
    fn tree_walk_sees_nested_results() {
        let sig = ReferrerDescriptor::for_content("sig", b"a");
        let sbom = ReferrerDescriptor::for_content("sbom", b"b");
        let deep = ReferrerDescriptor::for_content("sig", b"c");
        let tree = VerificationTree::new(
            ArtifactReference::new("app", DIGEST),
            vec![
                VerificationResult::passed("v1", &sig, "ok"),
                VerificationResult::passed("v2", &sbom, "ok")
                    .with_nested(vec![VerificationResult::skipped(&deep, SkipReason::DepthExceeded)]),
            ],
        );
        assert_eq!(tree.all_results().len(), 3);
        assert_eq!(tree.verified_digests(), vec![sig.digest.as_str(), sbom.digest.as_str()]);
        assert_eq!(tree.find(&deep.digest)[0].skip_reason(), Some(SkipReason::DepthExceeded));
    }

    #[test]
    fn verified_digests_are_unique_even_when_interleaved() {
        let sig = ReferrerDescriptor::for_content("sig", b"a");
        let sbom = ReferrerDescriptor::for_content("sbom", b"b");
        let tree = VerificationTree::new(
            ArtifactReference::new("app", DIGEST),
            vec![
                VerificationResult::passed("v1", &sig, "ok"),
                VerificationResult::passed("v1", &sbom, "ok"),
                VerificationResult::failed("v2", &sig, "bad"),
            ],
        );
        assert_eq!(tree.verified_digests(), vec![sig.digest.as_str(), sbom.digest.as_str()]);
    }

    #[test]
    fn status_serializes_with_kind_tag() {
        let json = serde_json::to_value(ResultStatus::Skipped { reason: SkipReason::NoVerifier }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "skipped", "reason": "noVerifier"}));
    }

    #[test]
    fn resource_key_formats_namespace() {
        assert_eq!(ResourceKey::new("gatekeeper-system", "notation").as_str(), "gatekeeper-system/notation");
        assert_eq!(ResourceKey::new("", "cluster-wide").as_str(), "cluster-wide");
    }
}
