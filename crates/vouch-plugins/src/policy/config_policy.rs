//! `configpolicy` built-in: declarative any-of / all-of rules per artifact type.
//!
//! Parameters (all optional):
//! ```json
//! { "name": "configpolicy",
//!   "defaultMode": "any",
//!   "artifactVerificationPolicies": { "application/spdx+json": "all" },
//!   "requireCompleteness": false,
//!   "onTimeout": "deny" }
//! ```
//! Per artifact type at each level of the tree, `any` needs at least one
//! verifier result to pass and `all` needs every one to pass. A result only
//! passes when everything nested under it passes too. Skipped referrers are
//! ignored unless `requireCompleteness` is set. A tree with no passing
//! verification at all is denied.
//!
//! `onTimeout: indeterminate` only applies when the timeouts alone decide
//! the outcome: the tree would have been allowed had every timed-out result
//! passed. Any other failure is still an explicit deny.

use super::PolicyProvider;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use vouch_core::{
    Decision, Error, PluginConfig, Result, ResultStatus, Verdict, VerificationResult,
    VerificationTree,
};

pub const NAME: &str = "configpolicy";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Any,
    All,
}

/// What a timed-out branch turns a failing decision into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutVerdict {
    #[default]
    Deny,
    Indeterminate,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Params {
    default_mode: MatchMode,
    artifact_verification_policies: HashMap<String, MatchMode>,
    require_completeness: bool,
    on_timeout: TimeoutVerdict,
}

pub struct ConfigPolicy {
    name: String,
    params: Params,
}

#[derive(Default)]
struct Tally {
    reasons: Vec<String>,
    passed: usize,
    timed_out: bool,
}

impl ConfigPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Params::default(),
        }
    }

    pub fn with_mode(mut self, artifact_type: impl Into<String>, mode: MatchMode) -> Self {
        self.params.artifact_verification_policies.insert(artifact_type.into(), mode);
        self
    }

    pub fn with_default_mode(mut self, mode: MatchMode) -> Self {
        self.params.default_mode = mode;
        self
    }

    pub fn require_completeness(mut self, required: bool) -> Self {
        self.params.require_completeness = required;
        self
    }

    pub fn on_timeout(mut self, verdict: TimeoutVerdict) -> Self {
        self.params.on_timeout = verdict;
        self
    }

    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let name = config.name()?.to_string();
        let params: Params = config
            .decode()
            .map_err(|e| Error::policy(format!("invalid configpolicy parameters: {}", e)))?;
        Ok(Self { name, params })
    }

    pub fn create(_version: &str, config: &PluginConfig) -> Result<Arc<dyn PolicyProvider>> {
        Ok(Arc::new(Self::from_config(config)?))
    }

    /// Would the tree pass had every timed-out result passed?
    fn passes_without_timeouts(&self, tree: &VerificationTree) -> bool {
        let mut tally = Tally::default();
        self.evaluate_level(&tree.results, true, &mut tally) && tally.passed > 0
    }

    fn mode_for(&self, artifact_type: &str) -> MatchMode {
        self.params
            .artifact_verification_policies
            .get(artifact_type)
            .copied()
            .unwrap_or(self.params.default_mode)
    }

    /// Does this level pass? Groups results by artifact type in discovery order.
    /// With `timeouts_pass`, timed-out results count as passing verifications.
    /// A referrer's nested subtree is judged once and applies to every
    /// result for that referrer, whichever of them carries it.
    fn evaluate_level(
        &self,
        results: &[VerificationResult],
        timeouts_pass: bool,
        tally: &mut Tally,
    ) -> bool {
        let mut groups: Vec<(&str, Vec<&VerificationResult>)> = Vec::new();
        for result in results {
            match groups.iter_mut().find(|(t, _)| *t == result.artifact_type) {
                Some((_, members)) => members.push(result),
                None => groups.push((result.artifact_type.as_str(), vec![result])),
            }
        }

        let mut subtree_ok: HashMap<&str, bool> = HashMap::new();
        for result in results.iter().filter(|r| !r.nested.is_empty()) {
            let ok = self.evaluate_level(&result.nested, timeouts_pass, tally);
            *subtree_ok.entry(result.referrer_digest.as_str()).or_insert(true) &= ok;
        }

        let mut level_ok = true;
        for (artifact_type, members) in groups {
            let mut outcomes = Vec::new();
            for result in members {
                let nested_ok = subtree_ok
                    .get(result.referrer_digest.as_str())
                    .copied()
                    .unwrap_or(true);
                match result.status {
                    ResultStatus::Skipped { .. } => {
                        if self.params.require_completeness {
                            tally.reasons.push(format!(
                                "{} {}: {}",
                                artifact_type, result.referrer_digest, result.message
                            ));
                            level_ok = false;
                        }
                        if !nested_ok {
                            level_ok = false;
                        }
                    }
                    status => {
                        let timed_out = status == ResultStatus::TimedOut;
                        tally.timed_out |= timed_out;
                        let passed = (result.success && status == ResultStatus::Verified)
                            || (timed_out && timeouts_pass);
                        if passed {
                            tally.passed += 1;
                        }
                        let ok = passed && nested_ok;
                        outcomes.push((result, ok));
                    }
                }
            }

            if outcomes.is_empty() {
                continue;
            }
            let group_ok = match self.mode_for(artifact_type) {
                MatchMode::Any => outcomes.iter().any(|(_, ok)| *ok),
                MatchMode::All => outcomes.iter().all(|(_, ok)| *ok),
            };
            if !group_ok {
                level_ok = false;
                for (result, _) in outcomes.iter().filter(|(_, ok)| !*ok) {
                    tally.reasons.push(format!(
                        "{} {} ({}): {}",
                        artifact_type,
                        result.referrer_digest,
                        result.verifier_name.as_deref().unwrap_or("-"),
                        result.message
                    ));
                }
            }
        }
        level_ok
    }
}

/// Reject trees a verifier or store could not have produced.
fn validate(tree: &VerificationTree) -> Result<()> {
    for result in tree.all_results() {
        if result.artifact_type.is_empty() || result.referrer_digest.is_empty() {
            return Err(Error::policy("result without artifact type or referrer digest"));
        }
        if result.status == ResultStatus::Verified && result.verifier_name.is_none() {
            return Err(Error::policy(format!(
                "verified result for {} has no verifier name",
                result.referrer_digest
            )));
        }
        if result.success && result.status != ResultStatus::Verified {
            return Err(Error::policy(format!(
                "result for {} claims success without being verified",
                result.referrer_digest
            )));
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl PolicyProvider for ConfigPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, tree: &VerificationTree) -> Result<Decision> {
        validate(tree)?;

        let mut tally = Tally::default();
        let tree_ok = self.evaluate_level(&tree.results, false, &mut tally);
        if tree_ok && tally.passed > 0 {
            return Ok(Decision::allow(tree.clone()));
        }
        if tally.passed == 0 && tally.reasons.is_empty() {
            tally.reasons.push("no referrer was successfully verified".into());
        }

        let verdict = if tally.timed_out
            && self.params.on_timeout == TimeoutVerdict::Indeterminate
            && self.passes_without_timeouts(tree)
        {
            Verdict::Indeterminate
        } else {
            Verdict::Deny
        };
        Ok(Decision::new(verdict, tally.reasons, tree.clone()))
    }
}
