//! Executor - one verification request, end to end.
//!
//! The executor DESCENDS the referrer graph of a subject:
//! - stores are tried in order until one lists the subject's referrers
//! - each referrer gets every verifier that claims its artifact type, all at once
//! - referrers of nested types are listed and descended with depth + 1
//! - the finished tree goes to the policy, whose decision is returned
//!
//! Every store call and verifier call races the request deadline. A branch
//! that loses is recorded as timed out; its siblings carry on.

use bytes::Bytes;
use futures::future::join_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vouch_core::{
    ArtifactReference, Decision, Error, ExecutorConfig, ReferrerDescriptor, Result, SkipReason,
    VerificationResult, VerificationTree,
};
use vouch_plugins::{collect_referrers, PolicyProvider, ReferenceVerifier, ReferrerStore};

const DEADLINE_EXCEEDED: &str = "request deadline exceeded";

/// The instances one request runs against, fixed for its whole duration.
#[derive(Clone, Default)]
pub struct Components {
    pub stores: Vec<Arc<dyn ReferrerStore>>,
    pub verifiers: Vec<Arc<dyn ReferenceVerifier>>,
    pub policy: Option<Arc<dyn PolicyProvider>>,
}

/// Where the executor gets its components at the start of each request.
pub trait ComponentSource: Send + Sync {
    fn components(&self) -> Components;
}

impl ComponentSource for Components {
    fn components(&self) -> Components {
        self.clone()
    }
}

type Branch<'a> = Pin<Box<dyn Future<Output = Vec<VerificationResult>> + Send + 'a>>;

/// Per-request state shared by every branch.
struct Request {
    id: Uuid,
    deadline: Instant,
    verifiers: Vec<Arc<dyn ReferenceVerifier>>,
    artifact_types: Vec<String>,
}

pub struct Executor {
    source: Arc<dyn ComponentSource>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(source: Arc<dyn ComponentSource>, config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { source, config })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Verify `subject` (`repository[:tag]@digest`) and return the policy's decision.
    ///
    /// `Err` only when no tree could be built at all: an unparsable subject, a
    /// missing store or policy, or every store failing. Policy errors come back
    /// as an indeterminate decision.
    pub async fn verify(&self, subject: &str) -> Result<Decision> {
        self.verify_with_cancel(subject, CancellationToken::new()).await
    }

    /// Like `verify`, abandoning all in-flight work once `cancel` fires.
    /// Plugin processes still running are killed.
    pub async fn verify_with_cancel(
        &self,
        subject: &str,
        cancel: CancellationToken,
    ) -> Result<Decision> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(subject, "verification cancelled");
                Err(Error::Cancelled)
            }
            decision = self.run(subject) => decision,
        }
    }

    async fn run(&self, subject: &str) -> Result<Decision> {
        let id = Uuid::new_v4();
        let subject = ArtifactReference::parse(subject)?;
        let components = self.source.components();
        let policy = components
            .policy
            .clone()
            .ok_or_else(|| Error::config("no policy provider is configured"))?;
        if components.stores.is_empty() {
            return Err(Error::config("no referrer store is configured"));
        }

        info!(request_id = %id, subject = %subject, "verification started");
        let request = Request {
            id,
            deadline: Instant::now() + self.config.request_timeout(),
            verifiers: components.verifiers,
            artifact_types: self.config.artifact_types.clone(),
        };

        let (store, referrers) = self.discover(&request, &components.stores, &subject).await?;
        debug!(request_id = %id, store = store.name(), count = referrers.len(), "referrers discovered");

        let path = vec![subject.digest.clone()];
        let results = self
            .verify_level(&request, store.as_ref(), &subject, referrers, 1, path)
            .await;

        let mut tree = VerificationTree::new(subject, results);
        tree.store = Some(store.name().to_string());

        let decision = match policy.evaluate(&tree).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(request_id = %id, policy = policy.name(), error = %e, "policy evaluation failed");
                Decision::indeterminate(tree, e.to_string())
            }
        };
        info!(
            request_id = %id,
            subject = %decision.tree.subject,
            verdict = %decision.verdict,
            "verification finished"
        );
        Ok(decision)
    }

    /// First store, in configured order, that lists the subject's referrers.
    async fn discover(
        &self,
        request: &Request,
        stores: &[Arc<dyn ReferrerStore>],
        subject: &ArtifactReference,
    ) -> Result<(Arc<dyn ReferrerStore>, Vec<ReferrerDescriptor>)> {
        let mut failures = Vec::new();
        for store in stores {
            let listing = timeout_at(
                request.deadline,
                collect_referrers(store.as_ref(), subject, &request.artifact_types),
            )
            .await;
            match listing {
                Ok(Ok(referrers)) => return Ok((Arc::clone(store), referrers)),
                Ok(Err(e)) => {
                    warn!(request_id = %request.id, store = store.name(), error = %e, "store failed, trying next");
                    failures.push(format!("{}: {}", store.name(), e));
                }
                Err(_) => {
                    warn!(request_id = %request.id, store = store.name(), "store exceeded the request deadline");
                    failures.push(format!("{}: {}", store.name(), DEADLINE_EXCEEDED));
                }
            }
        }
        Err(Error::store("all stores", failures.join("; ")))
    }

    /// Every referrer of one subject, concurrently, results in discovery order.
    fn verify_level<'a>(
        &'a self,
        request: &'a Request,
        store: &'a dyn ReferrerStore,
        subject: &'a ArtifactReference,
        referrers: Vec<ReferrerDescriptor>,
        depth: u32,
        path: Vec<String>,
    ) -> Branch<'a> {
        Box::pin(async move {
            let branches = referrers
                .into_iter()
                .map(|referrer| self.verify_referrer(request, store, subject, referrer, depth, &path));
            join_all(branches).await.into_iter().flatten().collect()
        })
    }

    /// Results for one referrer: one per applicable verifier, or a single skip.
    fn verify_referrer<'a>(
        &'a self,
        request: &'a Request,
        store: &'a dyn ReferrerStore,
        subject: &'a ArtifactReference,
        referrer: ReferrerDescriptor,
        depth: u32,
        path: &'a [String],
    ) -> Branch<'a> {
        Box::pin(async move {
            if depth > self.config.max_recursion_depth {
                debug!(request_id = %request.id, referrer = %referrer.digest, depth, "depth limit reached");
                return vec![VerificationResult::skipped(&referrer, SkipReason::DepthExceeded)];
            }
            if path.contains(&referrer.digest) {
                warn!(request_id = %request.id, referrer = %referrer.digest, "referrer cycle detected");
                return vec![VerificationResult::skipped(&referrer, SkipReason::Cycle)];
            }

            let selected: Vec<Arc<dyn ReferenceVerifier>> = request
                .verifiers
                .iter()
                .filter(|v| v.can_verify(&referrer.artifact_type))
                .cloned()
                .collect();

            let (mut results, nested) = tokio::join!(
                self.run_verifiers(request, store, subject, &referrer, &selected),
                self.nested_results(request, store, subject, &referrer, depth, path),
            );
            if results.is_empty() {
                debug!(request_id = %request.id, referrer = %referrer.digest, artifact_type = %referrer.artifact_type, "no verifier applies");
                results.push(VerificationResult::skipped(&referrer, SkipReason::NoVerifier));
            }
            // The subtree belongs to the referrer, so it hangs off its first result only.
            if !nested.is_empty() {
                if let Some(first) = results.first_mut() {
                    first.nested = nested;
                }
            }
            results
        })
    }

    /// Fetch the referrer's content once and run every selected verifier on it.
    async fn run_verifiers(
        &self,
        request: &Request,
        store: &dyn ReferrerStore,
        subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
        selected: &[Arc<dyn ReferenceVerifier>],
    ) -> Vec<VerificationResult> {
        if selected.is_empty() {
            return Vec::new();
        }

        let content: Bytes = match timeout_at(request.deadline, store.get_manifest(subject, referrer)).await {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                warn!(request_id = %request.id, store = store.name(), referrer = %referrer.digest, error = %e, "content fetch failed");
                let message = format!("fetching referrer content: {}", e);
                return selected
                    .iter()
                    .map(|v| failure(Some(v.name()), referrer, &e, message.clone()))
                    .collect();
            }
            Err(_) => {
                return selected
                    .iter()
                    .map(|v| VerificationResult::timed_out(Some(v.name()), referrer, DEADLINE_EXCEEDED))
                    .collect();
            }
        };

        let content = &content;
        let dispatches = selected.iter().map(|verifier| async move {
            match timeout_at(request.deadline, verifier.verify(subject, referrer, content)).await {
                Ok(Ok(result)) => {
                    debug!(request_id = %request.id, verifier = verifier.name(), referrer = %referrer.digest, success = result.success, "verifier finished");
                    result
                }
                Ok(Err(e)) => {
                    warn!(request_id = %request.id, verifier = verifier.name(), referrer = %referrer.digest, error = %e, "verifier failed");
                    failure(Some(verifier.name()), referrer, &e, e.to_string())
                }
                Err(_) => {
                    warn!(request_id = %request.id, verifier = verifier.name(), referrer = %referrer.digest, "verifier exceeded the request deadline");
                    VerificationResult::timed_out(Some(verifier.name()), referrer, DEADLINE_EXCEEDED)
                }
            }
        });
        join_all(dispatches).await
    }

    /// Referrers of `referrer` itself, when its type is configured to nest.
    async fn nested_results(
        &self,
        request: &Request,
        store: &dyn ReferrerStore,
        subject: &ArtifactReference,
        referrer: &ReferrerDescriptor,
        depth: u32,
        path: &[String],
    ) -> Vec<VerificationResult> {
        if !self.config.recurses_into(&referrer.artifact_type) {
            return Vec::new();
        }

        let nested_subject = referrer.as_subject(&subject.repository);
        let listing = timeout_at(
            request.deadline,
            collect_referrers(store, &nested_subject, &request.artifact_types),
        )
        .await;
        let children = match listing {
            Ok(Ok(children)) => children,
            Ok(Err(e)) => {
                warn!(request_id = %request.id, store = store.name(), referrer = %referrer.digest, error = %e, "nested listing failed");
                let message = format!("listing nested referrers: {}", e);
                return vec![failure(None, referrer, &e, message)];
            }
            Err(_) => {
                return vec![VerificationResult::timed_out(None, referrer, DEADLINE_EXCEEDED)];
            }
        };
        if children.is_empty() {
            return Vec::new();
        }

        let mut child_path = path.to_vec();
        child_path.push(referrer.digest.clone());
        self.verify_level(request, store, &nested_subject, children, depth + 1, child_path)
            .await
    }
}

fn failure(
    verifier: Option<&str>,
    referrer: &ReferrerDescriptor,
    error: &Error,
    message: String,
) -> VerificationResult {
    if error.is_timeout() {
        VerificationResult::timed_out(verifier, referrer, message)
    } else {
        VerificationResult::errored(verifier, referrer, message)
    }
}
