//! Referrer stores: where referrers of a subject and their content come from.

pub mod memory;
pub mod plugin;

use crate::factory::PluginKind;
use crate::protocol::ExternalPlugin;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use vouch_core::{
    ArtifactReference, Error, ReferrerDescriptor, ReferrerPage, ResourceKind, Result,
};

pub use memory::MemoryStore;
pub use plugin::PluginStore;

/// Pages one listing may span before the store is treated as broken.
pub const MAX_REFERRER_PAGES: usize = 1_000;
/// Referrers one listing may return in total.
pub const MAX_REFERRERS: usize = 10_000;

#[async_trait::async_trait]
pub trait ReferrerStore: Send + Sync {
    fn name(&self) -> &str;

    /// One page of referrers of `subject`. `artifact_types` filters when
    /// non-empty; `next_token` is the cursor returned by the previous page.
    async fn list_referrers(
        &self,
        subject: &ArtifactReference,
        artifact_types: &[String],
        next_token: Option<&str>,
    ) -> Result<ReferrerPage>;

    /// The referrer's own manifest bytes, handed to verifiers.
    async fn get_manifest(
        &self,
        subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
    ) -> Result<Bytes>;

    async fn get_blob_content(&self, subject: &ArtifactReference, digest: &str) -> Result<Bytes>;
}

/// Lazily walk every page of referrers. Each call starts from the first page.
/// A store that revisits a token, or exceeds the page or referrer caps, fails
/// the listing.
pub fn referrers<'a>(
    store: &'a dyn ReferrerStore,
    subject: &'a ArtifactReference,
    artifact_types: &'a [String],
) -> impl Stream<Item = Result<ReferrerDescriptor>> + Send + 'a {
    async_stream::try_stream! {
        let mut token: Option<String> = None;
        let mut seen = HashSet::new();
        let mut pages = 0usize;
        let mut total = 0usize;
        loop {
            pages += 1;
            if pages > MAX_REFERRER_PAGES {
                Err::<(), _>(Error::store(
                    store.name(),
                    format!("listing exceeds {} pages", MAX_REFERRER_PAGES),
                ))?;
            }
            let page = store
                .list_referrers(subject, artifact_types, token.as_deref())
                .await?;
            total += page.referrers.len();
            if total > MAX_REFERRERS {
                Err::<(), _>(Error::store(
                    store.name(),
                    format!("listing exceeds {} referrers", MAX_REFERRERS),
                ))?;
            }
            for referrer in page.referrers {
                yield referrer;
            }
            let next = match page.next_token {
                Some(t) if !t.is_empty() => t,
                _ => break,
            };
            if !seen.insert(next.clone()) {
                Err::<(), _>(Error::store(
                    store.name(),
                    format!("pagination token '{}' was already visited", next),
                ))?;
            }
            token = Some(next);
        }
    }
}

/// Drain `referrers` into discovery order.
pub async fn collect_referrers(
    store: &dyn ReferrerStore,
    subject: &ArtifactReference,
    artifact_types: &[String],
) -> Result<Vec<ReferrerDescriptor>> {
    referrers(store, subject, artifact_types).try_collect().await
}

pub struct StoreKind;

impl PluginKind for StoreKind {
    type Instance = dyn ReferrerStore;

    const KIND: ResourceKind = ResourceKind::Store;

    fn external(plugin: ExternalPlugin) -> Result<Arc<dyn ReferrerStore>> {
        Ok(Arc::new(PluginStore::new(plugin)))
    }
}
