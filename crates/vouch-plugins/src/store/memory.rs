//! `inmemory` built-in store: a fixed referrer graph held in memory.
//!
//! Parameters:
//! ```json
//! { "name": "inmemory", "pageSize": 50,
//!   "referrers": { "<subject digest>": [ { "artifactType": "...", "content": "..." } ] } }
//! ```
//! `contentBase64` may replace `content` for binary payloads. Digests and
//! sizes are derived from the content.

use super::ReferrerStore;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use vouch_core::{
    ArtifactReference, Error, PluginConfig, ReferrerDescriptor, ReferrerPage, Result,
};

pub const NAME: &str = "inmemory";
const DEFAULT_PAGE_SIZE: usize = 50;

pub struct MemoryStore {
    name: String,
    page_size: usize,
    referrers: HashMap<String, Vec<ReferrerDescriptor>>,
    blobs: HashMap<String, Bytes>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    page_size: Option<usize>,
    #[serde(default)]
    referrers: HashMap<String, Vec<ReferrerEntry>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferrerEntry {
    artifact_type: String,
    content: Option<String>,
    content_base64: Option<String>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            page_size: DEFAULT_PAGE_SIZE,
            referrers: HashMap::new(),
            blobs: HashMap::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Attach `content` as a referrer of `subject_digest` and return its descriptor.
    pub fn add_referrer(
        &mut self,
        subject_digest: &str,
        artifact_type: &str,
        content: impl Into<Bytes>,
    ) -> ReferrerDescriptor {
        let content = content.into();
        let descriptor = ReferrerDescriptor::for_content(artifact_type, &content);
        self.blobs.insert(descriptor.digest.clone(), content);
        self.referrers
            .entry(subject_digest.to_string())
            .or_default()
            .push(descriptor.clone());
        descriptor
    }

    /// Record a descriptor whose stored content deliberately differs from it.
    pub fn add_raw(&mut self, subject_digest: &str, descriptor: ReferrerDescriptor, content: impl Into<Bytes>) {
        self.blobs.insert(descriptor.digest.clone(), content.into());
        self.referrers
            .entry(subject_digest.to_string())
            .or_default()
            .push(descriptor);
    }

    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let params: Params = config.decode()?;
        let mut store = Self::new(config.name()?);
        if let Some(size) = params.page_size {
            if size == 0 {
                return Err(Error::config("inmemory: pageSize must be at least 1"));
            }
            store.page_size = size;
        }

        // Sort subjects so descriptor order does not depend on map iteration.
        let mut subjects: Vec<_> = params.referrers.into_iter().collect();
        subjects.sort_by(|a, b| a.0.cmp(&b.0));
        for (subject, entries) in subjects {
            for entry in entries {
                let content = match (entry.content, entry.content_base64) {
                    (Some(text), None) => Bytes::from(text.into_bytes()),
                    (None, Some(encoded)) => Bytes::from(
                        base64::engine::general_purpose::STANDARD
                            .decode(encoded)
                            .map_err(|e| Error::config(format!("inmemory: bad contentBase64: {}", e)))?,
                    ),
                    _ => {
                        return Err(Error::config(
                            "inmemory: each referrer needs exactly one of content or contentBase64",
                        ))
                    }
                };
                store.add_referrer(&subject, &entry.artifact_type, content);
            }
        }
        Ok(store)
    }

    /// Built-in factory entry point.
    pub fn create(_version: &str, config: &PluginConfig) -> Result<Arc<dyn ReferrerStore>> {
        Ok(Arc::new(Self::from_config(config)?))
    }
}

#[async_trait::async_trait]
impl ReferrerStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_referrers(
        &self,
        subject: &ArtifactReference,
        artifact_types: &[String],
        next_token: Option<&str>,
    ) -> Result<ReferrerPage> {
        let offset = match next_token {
            None => 0,
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| Error::store(&self.name, format!("invalid continuation token '{}'", t)))?,
        };

        let matching: Vec<&ReferrerDescriptor> = self
            .referrers
            .get(&subject.digest)
            .map(|all| {
                all.iter()
                    .filter(|d| artifact_types.is_empty() || artifact_types.contains(&d.artifact_type))
                    .collect()
            })
            .unwrap_or_default();

        if offset > matching.len() {
            return Err(Error::store(&self.name, format!("continuation token {} out of range", offset)));
        }
        let end = (offset + self.page_size).min(matching.len());
        Ok(ReferrerPage {
            referrers: matching[offset..end].iter().map(|d| (*d).clone()).collect(),
            next_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn get_manifest(
        &self,
        subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
    ) -> Result<Bytes> {
        self.get_blob_content(subject, &referrer.digest).await
    }

    async fn get_blob_content(&self, _subject: &ArtifactReference, digest: &str) -> Result<Bytes> {
        self.blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::store(&self.name, format!("blob {} not found", digest)))
    }
}
