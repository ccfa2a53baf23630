//! Pass orchestration: one full scan -> resolve -> mutate -> publish run
//! across all configured repositories.
//!
//! Independent repositories are processed by a bounded worker pool; work
//! for a single repository is strictly sequential and its working tree is
//! owned exclusively by its worker. The registry-result cache is shared
//! across the pool for the duration of the pass. A failure in one
//! repository never aborts the others; every repository reports its own
//! outcome and the pass always completes with a summary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::config::{AppConfig, RepoConfig};
use crate::errors::{ConfigError, MutateError, PlanError, PublishError, RegistryError};
use crate::extract;
use crate::git::{GitClient, SshAuth};
use crate::mutate::{self, CommitIdentity};
use crate::plan;
use crate::policy::PolicySet;
use crate::publish::Publisher;
use crate::registry::TagSource;
use crate::resolve::Resolver;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The outcome for one repository in one pass.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepoOutcome {
    /// Everything already matched the resolved candidates.
    NoChanges,
    /// A commit was pushed.
    Updated {
        commit_id: String,
        changes: Vec<String>,
        push_attempts: u32,
    },
    /// The repository failed; the others proceeded regardless.
    Failed { kind: String, message: String },
}

/// Per-repository result plus the non-fatal warnings gathered on the way.
#[derive(Debug, Clone, Serialize)]
pub struct RepoResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: RepoOutcome,
    pub warnings: Vec<String>,
}

/// The structured summary of one pass, for the invoking layer.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub pass_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub results: Vec<RepoResult>,
}

impl PassSummary {
    pub fn updated(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, RepoOutcome::Updated { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, RepoOutcome::Failed { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives passes over the configured repositories.
pub struct Orchestrator<S> {
    config: Arc<AppConfig>,
    policies: Arc<PolicySet>,
    source: Arc<S>,
    auth: Option<SshAuth>,
}

impl<S: TagSource + 'static> Orchestrator<S> {
    /// Build an orchestrator using the SSH material named in the config.
    pub fn new(config: AppConfig, source: Arc<S>) -> Result<Self, ConfigError> {
        let auth = SshAuth {
            key_path: config.git.ssh_key_path.clone(),
            known_hosts_path: config.git.known_hosts_path.clone(),
        };
        Self::with_auth(config, source, Some(auth))
    }

    /// Build an orchestrator with explicit (or no) transport auth.
    pub fn with_auth(
        config: AppConfig,
        source: Arc<S>,
        auth: Option<SshAuth>,
    ) -> Result<Self, ConfigError> {
        let policies = PolicySet::from_config(&config.policies)?;
        Ok(Self {
            config: Arc::new(config),
            policies: Arc::new(policies),
            source,
            auth,
        })
    }

    /// Run one pass. Never fails as a whole; per-repository problems are
    /// reported in the summary.
    #[instrument(skip(self))]
    pub async fn run_pass(&self) -> PassSummary {
        let pass_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            pass_id = %pass_id,
            repositories = self.config.repositories.len(),
            "starting pass"
        );

        // Per-pass context: the resolution cache must not outlive the pass.
        let resolver = Arc::new(Resolver::new(self.source.clone()));
        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_concurrent_repos));
        let deadline = self
            .config
            .sync
            .deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let mut join_set: JoinSet<(usize, RepoResult)> = JoinSet::new();
        for (index, repo) in self.config.repositories.iter().cloned().enumerate() {
            let config = self.config.clone();
            let policies = self.policies.clone();
            let resolver = resolver.clone();
            let auth = self.auth.clone();
            let semaphore = semaphore.clone();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");

                // The deadline gates *starting* a repository; in-flight
                // work finishes under its own timeouts.
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!(repo = %repo.name, "pass deadline reached before start");
                    return (
                        index,
                        RepoResult {
                            name: repo.name.clone(),
                            outcome: RepoOutcome::Failed {
                                kind: "deadline".into(),
                                message: "pass deadline reached before repository started"
                                    .into(),
                            },
                            warnings: Vec::new(),
                        },
                    );
                }

                let result =
                    run_repository(&config, &policies, &resolver, auth.as_ref(), &repo).await;
                (index, result)
            });
        }

        let mut indexed: Vec<(usize, RepoResult)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(pair) => indexed.push(pair),
                Err(e) => error!(error = %e, "repository worker panicked"),
            }
        }
        indexed.sort_by_key(|(i, _)| *i);
        let results: Vec<RepoResult> = indexed.into_iter().map(|(_, r)| r).collect();

        let summary = PassSummary {
            pass_id,
            started_at,
            completed_at: Utc::now(),
            results,
        };
        info!(
            updated = summary.updated(),
            failed = summary.failed(),
            total = summary.results.len(),
            "pass completed"
        );
        summary
    }
}

// ---------------------------------------------------------------------------
// Per-repository pipeline
// ---------------------------------------------------------------------------

/// One repository's extract -> plan -> mutate -> publish pipeline.
async fn run_repository<S: TagSource>(
    config: &AppConfig,
    policies: &PolicySet,
    resolver: &Resolver<S>,
    auth: Option<&SshAuth>,
    repo: &RepoConfig,
) -> RepoResult {
    let branch = config.branch_for(repo).to_string();
    let workdir = config.daemon.data_dir.join("repos").join(&repo.name);
    let identity = CommitIdentity {
        name: config.git.author_name.clone(),
        email: config.git.author_email.clone(),
    };
    let publisher = Publisher::new(config.sync.publish_retries);
    let mut warnings: Vec<String> = Vec::new();

    let git = match GitClient::clone_or_reset(&repo.url, &workdir, &branch, auth) {
        Ok(g) => g,
        Err(e) => return failed(repo, warnings, "git", e.to_string()),
    };

    let mut replans = 0;
    loop {
        let extraction = extract::extract(&workdir);
        warnings.extend(extraction.warnings.iter().map(ToString::to_string));

        let planned = match plan::plan(&extraction.references, policies, resolver).await {
            Ok(p) => p,
            Err(PlanError::Registry(e)) => {
                return failed(repo, warnings, registry_kind(&e), e.to_string())
            }
        };
        warnings.extend(
            planned
                .skipped
                .iter()
                .map(|s| format!("{}: {}", s.reference, s.detail)),
        );

        if planned.changes.is_empty() {
            info!(repo = %repo.name, "no changes");
            return RepoResult {
                name: repo.name.clone(),
                outcome: RepoOutcome::NoChanges,
                warnings,
            };
        }

        let tip = match git.head_oid() {
            Ok(t) => t,
            Err(e) => return failed(repo, warnings, "git", e.to_string()),
        };
        let descriptor = match mutate::apply(&git, &planned.changes, tip, &identity, &branch) {
            Ok(d) => d,
            Err(MutateError::ConcurrentModification { .. })
                if replans < config.sync.replan_retries =>
            {
                replans += 1;
                warn!(repo = %repo.name, replans, "tip moved during mutation, re-planning");
                match git
                    .fetch_branch(&branch, auth)
                    .and_then(|t| git.reset_hard(t))
                {
                    Ok(()) => continue,
                    Err(e) => return failed(repo, warnings, "git", e.to_string()),
                }
            }
            Err(e) => return failed(repo, warnings, "mutate", e.to_string()),
        };

        let changes: Vec<String> = planned
            .changes
            .iter()
            .map(|c| {
                format!(
                    "{} {} -> {}",
                    c.candidate.repository,
                    c.old_value(),
                    c.new_value()
                )
            })
            .collect();

        return match publisher.publish(&git, &planned.changes, descriptor, &identity, &branch, auth)
        {
            Ok(outcome) => {
                info!(
                    repo = %repo.name,
                    commit = %outcome.descriptor.commit_id,
                    changes = changes.len(),
                    "repository updated"
                );
                RepoResult {
                    name: repo.name.clone(),
                    outcome: RepoOutcome::Updated {
                        commit_id: outcome.descriptor.commit_id,
                        changes,
                        push_attempts: outcome.attempts,
                    },
                    warnings,
                }
            }
            Err(e) => failed(repo, warnings, publish_kind(&e), e.to_string()),
        };
    }
}

fn failed(repo: &RepoConfig, warnings: Vec<String>, kind: &str, message: String) -> RepoResult {
    error!(repo = %repo.name, kind, %message, "repository failed");
    RepoResult {
        name: repo.name.clone(),
        outcome: RepoOutcome::Failed {
            kind: kind.into(),
            message,
        },
        warnings,
    }
}

fn registry_kind(e: &RegistryError) -> &'static str {
    match e {
        RegistryError::Unavailable { .. } => "registry_unavailable",
        RegistryError::AuthenticationFailed { .. } => "registry_auth",
        RegistryError::NoMatchingVersion { .. } => "no_matching_version",
        RegistryError::Api { .. } | RegistryError::Parse { .. } => "registry",
    }
}

fn publish_kind(e: &PublishError) -> &'static str {
    match e {
        PublishError::AuthenticationFailed(_) => "authentication_failed",
        PublishError::PublishRejected { .. } => "publish_rejected",
        PublishError::PublishConflict { .. } => "publish_conflict",
        PublishError::Mutate(_) => "mutate",
        PublishError::Git(_) => "git",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::{bare_remote_with_files, FakeRegistry};

    const DIGEST: &str =
        "sha256:dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd";

    fn test_config(data_dir: &std::path::Path, repos: Vec<RepoConfig>) -> AppConfig {
        let mut config: AppConfig = toml::from_str(&format!(
            r#"
[daemon]
data_dir = "{}"

[git]
ssh_key_path = "/unused/id_ed25519"

[[repositories]]
name = "placeholder"
url = "placeholder"

[[policies]]
pattern = "app/*"
pinning = "tag"
semver = "^1"
"#,
            data_dir.display()
        ))
        .unwrap();
        config.repositories = repos;
        config
    }

    fn repo(name: &str, url: &str) -> RepoConfig {
        RepoConfig {
            name: name.into(),
            url: url.into(),
            branch: None,
        }
    }

    #[tokio::test]
    async fn test_pass_updates_and_reports_per_repository() {
        let (_r1, url1) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.0.0\n")]);
        let (_r2, url2) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.3.0\n")]);
        let data = tempfile::tempdir().unwrap();

        let source = Arc::new(
            FakeRegistry::new().with_repo("app/base", &[("1.3.0", DIGEST)]),
        );
        let config = test_config(
            data.path(),
            vec![repo("outdated", &url1), repo("current", &url2)],
        );
        let orchestrator = Orchestrator::with_auth(config, source, None).unwrap();

        let summary = orchestrator.run_pass().await;
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.updated(), 1);
        assert_eq!(summary.failed(), 0);

        assert_eq!(summary.results[0].name, "outdated");
        match &summary.results[0].outcome {
            RepoOutcome::Updated {
                changes,
                push_attempts,
                ..
            } => {
                assert_eq!(changes, &["app/base 1.0.0 -> 1.3.0"]);
                assert_eq!(*push_attempts, 1);
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert!(matches!(summary.results[1].outcome, RepoOutcome::NoChanges));
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let (_r, url) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.0.0\n")]);
        let data = tempfile::tempdir().unwrap();
        let source = Arc::new(
            FakeRegistry::new().with_repo("app/base", &[("1.3.0", DIGEST)]),
        );
        let config = test_config(data.path(), vec![repo("deployments", &url)]);
        let orchestrator = Orchestrator::with_auth(config, source, None).unwrap();

        let first = orchestrator.run_pass().await;
        assert_eq!(first.updated(), 1);

        let second = orchestrator.run_pass().await;
        assert_eq!(second.updated(), 0);
        assert!(matches!(second.results[0].outcome, RepoOutcome::NoChanges));
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_other_repositories() {
        let (_r, url) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.0.0\n")]);
        let data = tempfile::tempdir().unwrap();
        let source = Arc::new(
            FakeRegistry::new().with_repo("app/base", &[("1.3.0", DIGEST)]),
        );
        let config = test_config(
            data.path(),
            vec![repo("broken", "/nonexistent/remote.git"), repo("good", &url)],
        );
        let orchestrator = Orchestrator::with_auth(config, source, None).unwrap();

        let summary = orchestrator.run_pass().await;
        assert_eq!(summary.results.len(), 2);
        match &summary.results[0].outcome {
            RepoOutcome::Failed { kind, .. } => assert_eq!(kind, "git"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(matches!(
            summary.results[1].outcome,
            RepoOutcome::Updated { .. }
        ));
    }

    #[tokio::test]
    async fn test_registry_outage_is_a_scoped_failure() {
        let (_r, url) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.0.0\n")]);
        let data = tempfile::tempdir().unwrap();
        let mut fixture = FakeRegistry::new().with_repo("app/base", &[("1.3.0", DIGEST)]);
        fixture.unavailable = true;
        let config = test_config(data.path(), vec![repo("deployments", &url)]);
        let orchestrator = Orchestrator::with_auth(config, Arc::new(fixture), None).unwrap();

        let summary = orchestrator.run_pass().await;
        match &summary.results[0].outcome {
            RepoOutcome::Failed { kind, .. } => assert_eq!(kind, "registry_unavailable"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_queued_repositories() {
        let (_r, url) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.0.0\n")]);
        let data = tempfile::tempdir().unwrap();
        let source = Arc::new(
            FakeRegistry::new().with_repo("app/base", &[("1.3.0", DIGEST)]),
        );
        let mut config = test_config(data.path(), vec![repo("deployments", &url)]);
        config.sync.deadline_secs = Some(0);
        let orchestrator = Orchestrator::with_auth(config, source, None).unwrap();

        let summary = orchestrator.run_pass().await;
        match &summary.results[0].outcome {
            RepoOutcome::Failed { kind, .. } => assert_eq!(kind, "deadline"),
            other => panic!("expected deadline failure, got {:?}", other),
        }
    }

    #[test]
    fn test_summary_serializes_for_the_invoking_layer() {
        let summary = PassSummary {
            pass_id: "p".into(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            results: vec![RepoResult {
                name: "deployments".into(),
                outcome: RepoOutcome::Updated {
                    commit_id: "abc".into(),
                    changes: vec!["app/base 1.0.0 -> 1.3.0".into()],
                    push_attempts: 1,
                },
                warnings: vec![],
            }],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["results"][0]["outcome"], "updated");
        assert_eq!(json["results"][0]["commit_id"], "abc");
    }
}
