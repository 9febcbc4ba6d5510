//! Tests for vouch-plugins: factories, built-ins and the process protocol

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vouch_core::*;
use vouch_plugins::*;

fn factories() -> Factories {
    default_factories(PluginRunner::default())
}

fn subject() -> ArtifactReference {
    ArtifactReference::new("registry.local/app", sha256_digest(b"image"))
}

/// Write an executable `/bin/sh` plugin named `name` into `dir`.
#[cfg(unix)]
fn write_plugin(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A plugin body that drains stdin and prints `response`.
#[cfg(unix)]
fn replying(response: &serde_json::Value) -> String {
    format!("cat > /dev/null\nprintf '%s' '{}'", response)
}

// ===========================================================================
// Factory
// ===========================================================================

#[test]
fn default_factories_register_builtins() {
    let f = factories();
    assert_eq!(f.stores.builtin_names(), vec!["inmemory"]);
    assert_eq!(f.verifiers.builtin_names(), vec!["integrity"]);
    assert_eq!(f.policies.builtin_names(), vec!["configpolicy"]);
}

#[test]
#[should_panic(expected = "already registered")]
fn duplicate_builtin_registration_panics() {
    let mut f = factories();
    f.verifiers.register("integrity", IntegrityVerifier::create);
}

#[test]
fn try_register_reports_duplicates() {
    let mut f = factories();
    let err = f.stores.try_register("inmemory", MemoryStore::create).unwrap_err();
    assert!(matches!(err, Error::Factory(_)));
}

#[test]
fn builtin_created_from_config() {
    let f = factories();
    let cfg = PluginConfig::new("integrity").with("artifactTypes", "application/vnd.sig");
    let verifier = f.verifiers.create_from_config(&cfg, SPEC_VERSION, &[]).unwrap();
    assert_eq!(verifier.name(), "integrity");
    assert!(verifier.can_verify("application/vnd.sig"));
    assert!(!verifier.can_verify("application/spdx+json"));
}

#[test]
fn missing_name_is_a_config_error() {
    let f = factories();
    let cfg = PluginConfig::from_map(serde_json::Map::new());
    let err = f.verifiers.create_from_config(&cfg, SPEC_VERSION, &[]).err().unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn path_separator_rejected_before_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let f = factories();
    let cfg = PluginConfig::new("../escape");
    let err = f
        .verifiers
        .create_from_config(&cfg, SPEC_VERSION, &[dir.path().to_path_buf()])
        .err()
        .unwrap();
    assert!(matches!(err, Error::Factory(_)));
    assert!(err.to_string().contains("path separators"));
}

#[test]
fn unknown_plugin_not_found_is_a_factory_error() {
    let dir = tempfile::tempdir().unwrap();
    let f = factories();
    let cfg = PluginConfig::new("does-not-exist");
    let err = f
        .stores
        .create_from_config(&cfg, SPEC_VERSION, &[dir.path().to_path_buf()])
        .err()
        .unwrap();
    assert!(matches!(err, Error::Factory(_)));
    assert!(err.to_string().contains("not found"));
}

#[test]
fn unsupported_version_is_a_config_error() {
    let f = factories();
    let cfg = PluginConfig::new("integrity");
    let err = f.verifiers.create_from_config(&cfg, "9.9.9", &[]).err().unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn create_many_requires_at_least_one_plugin() {
    let f = factories();
    let list = PluginListConfig::default();
    let err = f.verifiers.create_many_from_config(&list, Path::new("/nonexistent")).err().unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn create_many_is_all_or_nothing() {
    let f = factories();
    let list = PluginListConfig {
        plugins: vec![PluginConfig::new("integrity"), PluginConfig::new("missing-verifier")],
        ..Default::default()
    };
    assert!(f.verifiers.create_many_from_config(&list, Path::new("/nonexistent")).is_err());

    let list = PluginListConfig {
        plugins: vec![
            PluginConfig::new("integrity").with("artifactTypes", "a"),
            PluginConfig::new("integrity").with("artifactTypes", "b"),
        ],
        ..Default::default()
    };
    let built = f.verifiers.create_many_from_config(&list, Path::new("/nonexistent")).unwrap();
    assert_eq!(built.len(), 2);
    assert!(built[0].can_verify("a"));
    assert!(built[1].can_verify("b"));
}

// ===========================================================================
// Built-ins
// ===========================================================================

#[tokio::test]
async fn memory_store_pages_through_referrers() {
    let mut store = MemoryStore::new("mem").with_page_size(2);
    let s = subject();
    for i in 0..5u8 {
        store.add_referrer(&s.digest, "application/vnd.sig", vec![i]);
    }
    let all = collect_referrers(&store, &s, &[]).await.unwrap();
    assert_eq!(all.len(), 5);
    assert_eq!(all[0].digest, sha256_digest(&[0]));
    assert_eq!(all[4].digest, sha256_digest(&[4]));
}

#[tokio::test]
async fn integrity_verifier_checks_content_digest() {
    let v = IntegrityVerifier::new("integrity", ArtifactTypes::any());
    let desc = ReferrerDescriptor::for_content("application/vnd.sig", b"signature");
    let ok = v.verify(&subject(), &desc, &Bytes::from_static(b"signature")).await.unwrap();
    assert!(ok.success);
    let tampered = ReferrerDescriptor::new(desc.digest.clone(), "application/vnd.sig", 9);
    let bad = v.verify(&subject(), &tampered, &Bytes::from_static(b"signatur!")).await.unwrap();
    assert!(!bad.success);
}

/// Store that returns `per_page` referrers per page and lets `next` pick the following token.
struct ScriptedPages {
    per_page: usize,
    next: fn(Option<&str>) -> Option<String>,
}

#[async_trait::async_trait]
impl ReferrerStore for ScriptedPages {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_referrers(
        &self,
        _subject: &ArtifactReference,
        _artifact_types: &[String],
        next_token: Option<&str>,
    ) -> Result<ReferrerPage> {
        let referrers = (0..self.per_page)
            .map(|i| ReferrerDescriptor::for_content("application/vnd.sig", format!("{:?}{}", next_token, i).as_bytes()))
            .collect();
        Ok(ReferrerPage {
            referrers,
            next_token: (self.next)(next_token),
        })
    }

    async fn get_manifest(&self, _subject: &ArtifactReference, _referrer: &ReferrerDescriptor) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn get_blob_content(&self, _subject: &ArtifactReference, _digest: &str) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}

#[tokio::test]
async fn alternating_pagination_tokens_fail_the_listing() {
    // a -> b -> a
    let store = ScriptedPages {
        per_page: 1,
        next: |token| match token {
            None | Some("b") => Some("a".to_string()),
            _ => Some("b".to_string()),
        },
    };
    let listing = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        collect_referrers(&store, &subject(), &[]),
    )
    .await
    .expect("listing must stop on its own");
    let err = listing.unwrap_err();
    assert!(matches!(err, Error::Store { .. }));
    assert!(err.to_string().contains("already visited"));
}

#[tokio::test]
async fn endless_fresh_tokens_hit_the_page_cap() {
    let store = ScriptedPages {
        per_page: 0,
        next: |token| Some(format!("{}x", token.unwrap_or(""))),
    };
    let err = collect_referrers(&store, &subject(), &[]).await.unwrap_err();
    assert!(matches!(err, Error::Store { .. }));
    assert!(err.to_string().contains(&format!("{} pages", MAX_REFERRER_PAGES)));
}

#[tokio::test]
async fn oversized_listing_hits_the_referrer_cap() {
    let store = ScriptedPages {
        per_page: MAX_REFERRERS / 4 + 1,
        next: |token| Some(format!("{}x", token.unwrap_or(""))),
    };
    let err = collect_referrers(&store, &subject(), &[]).await.unwrap_err();
    assert!(err.to_string().contains(&format!("{} referrers", MAX_REFERRERS)));
}

// ===========================================================================
// External plugins
// ===========================================================================

#[cfg(unix)]
mod external {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn verifier_config(name: &str) -> PluginConfig {
        PluginConfig::new(name).with("artifactTypes", "application/vnd.sig")
    }

    #[tokio::test]
    async fn verifier_plugin_passes_and_reports_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "sig-check",
            &replying(&json!({"version": "1.0.0", "success": true, "message": "signed by ci", "issuer": "ci"})),
        );
        let verifier = factories()
            .verifiers
            .create_from_config(&verifier_config("sig-check"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let desc = ReferrerDescriptor::for_content("application/vnd.sig", b"sig");
        let result = verifier.verify(&subject(), &desc, &Bytes::from_static(b"sig")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.verifier_name.as_deref(), Some("sig-check"));
        assert_eq!(result.message, "signed by ci");
        assert_eq!(result.extensions["issuer"], "ci");
    }

    #[tokio::test]
    async fn verifier_plugin_sees_command_and_version_env() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "env-check",
            r#"cat > /dev/null
if [ "$VOUCH_COMMAND" = "verify" ] && [ "$VOUCH_VERSION" = "1.0.0" ]; then
  printf '{"version":"1.0.0","success":true}'
else
  printf '{"version":"1.0.0","success":false,"message":"bad env"}'
fi"#,
        );
        let verifier = factories()
            .verifiers
            .create_from_config(&verifier_config("env-check"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let desc = ReferrerDescriptor::for_content("application/vnd.sig", b"sig");
        let result = verifier.verify(&subject(), &desc, &Bytes::from_static(b"sig")).await.unwrap();
        assert!(result.success, "{}", result.message);
    }

    #[test]
    fn external_verifier_requires_artifact_types() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "untyped", "exit 0");
        let err = factories()
            .verifiers
            .create_from_config(&PluginConfig::new("untyped"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    async fn invoke_failure(body: &str, runner: PluginRunner) -> InvocationFailure {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "flaky", body);
        let verifier = default_factories(runner)
            .verifiers
            .create_from_config(&verifier_config("flaky"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let desc = ReferrerDescriptor::for_content("application/vnd.sig", b"sig");
        match verifier.verify(&subject(), &desc, &Bytes::from_static(b"sig")).await {
            Err(Error::PluginInvocation { plugin, failure }) => {
                assert_eq!(plugin, "flaky");
                failure
            }
            other => panic!("expected invocation failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_invocation_failure() {
        let failure = invoke_failure(
            "cat > /dev/null\necho 'boom' >&2\nprintf '{\"version\":\"1.0.0\",\"success\":true}'\nexit 3",
            PluginRunner::default(),
        )
        .await;
        assert_eq!(
            failure,
            InvocationFailure::NonZeroExit {
                code: Some(3),
                stderr: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn garbage_output_is_malformed() {
        let failure = invoke_failure("cat > /dev/null\necho 'not json'", PluginRunner::default()).await;
        assert!(matches!(failure, InvocationFailure::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn two_results_are_malformed() {
        let failure = invoke_failure(
            "cat > /dev/null\nprintf '{\"version\":\"1.0.0\",\"success\":true}{\"version\":\"1.0.0\",\"success\":true}'",
            PluginRunner::default(),
        )
        .await;
        assert!(matches!(failure, InvocationFailure::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn unsupported_result_version_is_rejected() {
        let failure = invoke_failure(
            &replying(&json!({"version": "0.1.0", "success": true})),
            PluginRunner::default(),
        )
        .await;
        assert!(matches!(failure, InvocationFailure::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn slow_plugin_times_out() {
        let runner = PluginRunner::new(&PluginRunnerConfig {
            timeout_ms: 200,
            ..Default::default()
        });
        let started = std::time::Instant::now();
        let failure = invoke_failure("sleep 5", runner).await;
        assert_eq!(failure, InvocationFailure::Timeout(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn endless_output_is_malformed_not_a_timeout() {
        let runner = PluginRunner::new(&PluginRunnerConfig {
            timeout_ms: 20_000,
            ..Default::default()
        });
        let started = std::time::Instant::now();
        let failure = invoke_failure("cat > /dev/null\nyes", runner).await;
        match failure {
            InvocationFailure::MalformedOutput(message) => {
                assert!(message.contains(&vouch_plugins::protocol::MAX_OUTPUT_BYTES.to_string()))
            }
            other => panic!("expected malformed output, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn waiting_for_a_permit_counts_against_the_timeout() {
        let runner = PluginRunner::new(&PluginRunnerConfig {
            timeout_ms: 1_000,
            max_concurrent_invocations: 1,
        });
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "slow", "cat > /dev/null\nsleep 5");
        let verifier = default_factories(runner)
            .verifiers
            .create_from_config(&verifier_config("slow"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let desc = ReferrerDescriptor::for_content("application/vnd.sig", b"sig");
        let content = Bytes::from_static(b"sig");
        let subject_a = subject();
        let subject_b = subject();
        let started = std::time::Instant::now();
        let (first, second) = tokio::join!(
            verifier.verify(&subject_a, &desc, &content),
            verifier.verify(&subject_b, &desc, &content),
        );
        for outcome in [first, second] {
            assert!(matches!(
                outcome,
                Err(Error::PluginInvocation { failure: InvocationFailure::Timeout(_), .. })
            ));
        }
        // Both calls give up at the same deadline; the queued one does not wait its turn first.
        assert!(started.elapsed() < Duration::from_millis(1_800));
    }

    #[tokio::test]
    async fn plugin_store_follows_next_token() {
        let first = ReferrerDescriptor::for_content("application/vnd.sig", b"one");
        let second = ReferrerDescriptor::for_content("application/vnd.sig", b"two");
        let page1 = json!({"version": "1.0.0", "success": true, "referrers": [first], "nextToken": "p2"});
        let page2 = json!({"version": "1.0.0", "success": true, "referrers": [second]});
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "paged-store",
            &format!(
                "input=$(cat)\ncase \"$input\" in\n  *'\"nextToken\":\"p2\"'*) printf '%s' '{}' ;;\n  *) printf '%s' '{}' ;;\nesac",
                page2, page1
            ),
        );
        let store = factories()
            .stores
            .create_from_config(&PluginConfig::new("paged-store"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let all = collect_referrers(store.as_ref(), &subject(), &[]).await.unwrap();
        assert_eq!(all, vec![first, second]);
    }

    #[tokio::test]
    async fn plugin_store_returns_decoded_content() {
        // base64("manifest")
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "content-store",
            &replying(&json!({"version": "1.0.0", "success": true, "content": "bWFuaWZlc3Q="})),
        );
        let store = factories()
            .stores
            .create_from_config(&PluginConfig::new("content-store"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let desc = ReferrerDescriptor::for_content("application/vnd.sig", b"manifest");
        let content = store.get_manifest(&subject(), &desc).await.unwrap();
        assert_eq!(&content[..], b"manifest");
    }

    #[tokio::test]
    async fn unsuccessful_store_result_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "down-store",
            &replying(&json!({"version": "1.0.0", "success": false, "message": "registry unreachable"})),
        );
        let store = factories()
            .stores
            .create_from_config(&PluginConfig::new("down-store"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let err = collect_referrers(store.as_ref(), &subject(), &[]).await.unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
        assert!(err.to_string().contains("registry unreachable"));
    }

    #[tokio::test]
    async fn policy_plugin_verdict_and_reasons() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "opa-lite",
            &replying(&json!({
                "version": "1.0.0",
                "success": false,
                "verdict": "indeterminate",
                "reasons": ["sbom verifier unavailable"]
            })),
        );
        let policy = factories()
            .policies
            .create_from_config(&PluginConfig::new("opa-lite"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let tree = VerificationTree::new(subject(), vec![]);
        let decision = policy.evaluate(&tree).await.unwrap();
        assert_eq!(decision.verdict, Verdict::Indeterminate);
        assert_eq!(decision.reasons, vec!["sbom verifier unavailable"]);
    }

    #[tokio::test]
    async fn policy_plugin_cannot_allow_while_failing() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "confused",
            &replying(&json!({"version": "1.0.0", "success": false, "verdict": "allow"})),
        );
        let policy = factories()
            .policies
            .create_from_config(&PluginConfig::new("confused"), SPEC_VERSION, &[dir.path().to_path_buf()])
            .unwrap();
        let err = policy.evaluate(&VerificationTree::new(subject(), vec![])).await.unwrap_err();
        assert!(matches!(err, Error::Policy(_)));
    }
}

#[test]
fn factories_are_shareable() {
    let f = Arc::new(factories());
    let g = Arc::clone(&f);
    assert!(g.stores.is_builtin("inmemory"));
}
